//! Ocean node and client binary.
//!
//! Usage:
//!   ocean init                       # write config, genesis, validator key
//!   ocean start                      # run the node
//!   ocean keys add --name alice      # create a named account key
//!   ocean keys validator             # create or show the validator key
//!   ocean query account <address>    # query an account over RPC
//!   ocean tx transfer --from-key <file> --to <address> --amount N

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use ocean::config::OceanConfig;
use ocean::crypto::{keystore, Address, Keypair};
use ocean::genesis::{Genesis, GenesisAccount, GenesisValidator};
use ocean::transaction::{self, Payload, PayloadEnvelope, Transaction};

/// Ocean: a gas-less DPoS blockchain node with BFT finality.
#[derive(Parser, Debug)]
#[command(name = "ocean", version, about = "Ocean gas-less DPoS blockchain node")]
struct Cli {
    /// Home directory for config, keys, and chain data.
    #[arg(long, default_value = "./ocean-data", global = true)]
    home: PathBuf,

    /// RPC address for client commands.
    #[arg(long, default_value = "127.0.0.1:26657", global = true)]
    rpc: SocketAddr,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Initialize the home directory: config file, genesis, validator key.
    Init {
        /// Chain identifier for the new genesis.
        #[arg(long, default_value = ocean::constants::DEFAULT_CHAIN_ID)]
        chain_id: String,
    },

    /// Start the node.
    Start,

    /// Key management.
    Keys {
        #[command(subcommand)]
        action: KeysAction,
    },

    /// Query chain state over RPC.
    Query {
        #[command(subcommand)]
        action: QueryAction,
    },

    /// Build, sign, and submit transactions over RPC.
    Tx {
        #[command(subcommand)]
        action: TxAction,
    },
}

#[derive(Subcommand, Debug)]
enum KeysAction {
    /// Generate a named account key under `<home>/keys/`.
    Add {
        #[arg(long)]
        name: String,
    },
    /// Generate (or show) the validator consensus key.
    Validator,
}

#[derive(Subcommand, Debug)]
enum QueryAction {
    /// Show an account's balance, nonce, stake, and RC.
    Account { address: String },
}

#[derive(Subcommand, Debug)]
enum TxAction {
    /// Transfer funds between accounts.
    Transfer {
        /// Key file of the sender (from `keys add`).
        #[arg(long)]
        from_key: PathBuf,
        /// Recipient address.
        #[arg(long)]
        to: String,
        /// Amount in base units.
        #[arg(long)]
        amount: u64,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    match cli.command {
        Command::Init { chain_id } => cmd_init(&cli.home, &chain_id),
        Command::Start => cmd_start(&cli.home).await,
        Command::Keys { action } => match action {
            KeysAction::Add { name } => cmd_keys_add(&cli.home, &name),
            KeysAction::Validator => cmd_keys_validator(&cli.home),
        },
        Command::Query { action } => match action {
            QueryAction::Account { address } => cmd_query_account(cli.rpc, &address).await,
        },
        Command::Tx { action } => match action {
            TxAction::Transfer {
                from_key,
                to,
                amount,
            } => cmd_tx_transfer(cli.rpc, &from_key, &to, amount).await,
        },
    }
}

/// Write config, validator key, and a single-validator genesis so a fresh
/// home directory can start producing blocks immediately.
fn cmd_init(home: &PathBuf, chain_id: &str) -> Result<(), Box<dyn std::error::Error>> {
    let config = OceanConfig::default();
    config.save(home)?;

    let key_path = home.join(&config.node.validator_key_file);
    let keypair = ocean::node::load_or_generate_keypair(&key_path)?;
    let address = keypair.address()?;

    let mut genesis = Genesis::default_with_chain_id(chain_id);
    genesis.validators.push(GenesisValidator {
        address: address.clone(),
        consensus_pubkey: keypair.public_key(),
        stake: genesis.min_validator_stake,
        commission: 1000,
    });
    genesis.accounts.push(GenesisAccount {
        address: address.clone(),
        balance: 1_000_000_000,
        stake: genesis.min_validator_stake,
    });
    genesis.save(&home.join("config").join("genesis.json"))?;

    println!("Initialized {} at {}", chain_id, home.display());
    println!("Validator address: {}", address);
    Ok(())
}

async fn cmd_start(home: &PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let config = OceanConfig::load(home);
    tracing::info!(
        moniker = %config.node.moniker,
        home = %home.display(),
        "starting ocean node"
    );

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("Ctrl-C received, shutting down...");
        signal_token.cancel();
    });

    let node = ocean::node::Node::start(home, config, shutdown).await?;
    node.run().await;
    Ok(())
}

fn cmd_keys_add(home: &PathBuf, name: &str) -> Result<(), Box<dyn std::error::Error>> {
    let path = home.join("keys").join(format!("{}.json", name));
    if path.exists() {
        return Err(format!("key file already exists: {}", path.display()).into());
    }
    let keypair = Keypair::generate();
    keystore::save_keypair(&path, &keypair)?;
    println!("Key '{}' written to {}", name, path.display());
    println!("Address: {}", keypair.address()?);
    Ok(())
}

fn cmd_keys_validator(home: &PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let config = OceanConfig::load(home);
    let path = home.join(&config.node.validator_key_file);
    let keypair = ocean::node::load_or_generate_keypair(&path)?;
    println!("Validator key: {}", path.display());
    println!("Address: {}", keypair.address()?);
    Ok(())
}

async fn cmd_query_account(
    rpc: SocketAddr,
    address: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    // Validate locally for a friendlier error than a 400.
    Address::parse(address)?;
    let client = reqwest::Client::new();
    let resp = client
        .get(format!("http://{}/account/{}", rpc, address))
        .send()
        .await?;
    if !resp.status().is_success() {
        return Err(format!("query failed: {}", resp.text().await?).into());
    }
    let account: serde_json::Value = resp.json().await?;
    println!("{}", serde_json::to_string_pretty(&account)?);
    Ok(())
}

async fn cmd_tx_transfer(
    rpc: SocketAddr,
    from_key: &PathBuf,
    to: &str,
    amount: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    let keypair = keystore::load_keypair(from_key)?;
    let from = keypair.address()?;
    let to = Address::parse(to)?;

    let client = reqwest::Client::new();
    let resp = client
        .get(format!("http://{}/account/{}", rpc, from))
        .send()
        .await?;
    if !resp.status().is_success() {
        return Err(format!("account lookup failed: {}", resp.text().await?).into());
    }
    let account: serde_json::Value = resp.json().await?;
    let nonce = account["nonce"].as_u64().unwrap_or(0);

    // Always carry the sender pubkey: required on first spend, and it must
    // match the registered key on later spends anyway.
    let envelope = PayloadEnvelope::with_sender_pubkey(
        Payload::Transfer {
            to: to.clone(),
            amount,
        },
        keypair.public_key(),
    );
    let mut tx = Transaction {
        from,
        to,
        nonce,
        payload: envelope.encode(),
        signature: Vec::new(),
    };
    transaction::sign(&mut tx, &keypair);

    let tx_hex = hex::encode(ocean::codec::encode_transaction(&tx));
    let resp = client
        .post(format!("http://{}/tx", rpc))
        .json(&serde_json::json!({ "tx_hex": tx_hex }))
        .send()
        .await?;
    if !resp.status().is_success() {
        return Err(format!("transaction rejected: {}", resp.text().await?).into());
    }
    let body: serde_json::Value = resp.json().await?;
    println!(
        "Submitted transfer of {} to {}: {}",
        amount,
        tx.to,
        body["tx_hash"].as_str().unwrap_or("")
    );
    Ok(())
}
