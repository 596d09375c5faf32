//! Deterministic WASM contract host.
//!
//! The host's consensus-visible surface is deliberately narrow: module
//! validation and the cached per-contract cost estimates. Estimates are a
//! pure function of the deployed code (`instructions = len(code)`,
//! `state_writes = 1`) and MUST be reproduced bit-identically across nodes;
//! the RC cost function consumes them. Execution itself runs inside a
//! bounded wasmtime store and a trap surfaces as a transaction error, never
//! a node crash.

use std::collections::HashMap;

use parking_lot::RwLock;
use wasmtime::{Config, Engine, Instance, Module, Store, StoreLimits, StoreLimitsBuilder, Val};

use crate::crypto::Address;

/// WASM module magic prefix `\0asm`.
const WASM_MAGIC: [u8; 4] = [0x00, 0x61, 0x73, 0x6d];

/// Conservative float-opcode screen: f32/f64 const, add, sub, mul, div.
const FLOAT_OPCODES: [u8; 10] = [0x43, 0x44, 0x8b, 0x8c, 0x8d, 0x8e, 0x99, 0x9a, 0x9b, 0x9c];

/// Linear memory ceiling per instantiation (64 MiB).
const MAX_MEMORY_BYTES: usize = 64 * 1024 * 1024;

/// Host stack ceiling, bounding call depth.
const MAX_WASM_STACK: usize = 512 * 1024;

/// The exported entry point a contract call invokes.
const ENTRY_POINT: &str = "handle";

/// Errors from contract validation, deployment, and execution.
#[derive(Debug, thiserror::Error)]
pub enum ContractError {
    #[error("empty contract code")]
    EmptyCode,
    #[error("invalid WASM magic number")]
    BadMagic,
    #[error("wasm contains floating-point opcodes")]
    FloatOpcodes,
    #[error("contract already exists at {0}")]
    AlreadyExists(Address),
    #[error("contract not found: {0}")]
    NotFound(Address),
    #[error("failed to compile wasm module: {0}")]
    Compile(String),
    #[error("failed to instantiate wasm module: {0}")]
    Instantiate(String),
    #[error("wasm execution failed: {0}")]
    Execution(String),
    #[error("wasm engine setup failed: {0}")]
    Engine(String),
}

/// Execution metadata consumed by RC accounting.
#[derive(Clone, Debug)]
pub struct ExecutionResult {
    pub output: Vec<u8>,
    pub instructions: u64,
    pub state_writes: u64,
}

struct ContractEntry {
    owner: Address,
    code: Vec<u8>,
    module: Module,
    instruction_estimate: u64,
    state_write_estimate: u64,
}

struct StoreData {
    limits: StoreLimits,
}

/// Manages deployed contracts and their bounded execution.
pub struct ContractHost {
    engine: Engine,
    contracts: RwLock<HashMap<Address, ContractEntry>>,
}

impl ContractHost {
    pub fn new() -> Result<Self, ContractError> {
        let mut config = Config::new();
        config.max_wasm_stack(MAX_WASM_STACK);
        let engine = Engine::new(&config).map_err(|e| ContractError::Engine(e.to_string()))?;
        Ok(ContractHost {
            engine,
            contracts: RwLock::new(HashMap::new()),
        })
    }

    /// Deploy a contract at `address`. Validates and compiles eagerly so
    /// errors surface at deploy time, and caches the deterministic cost
    /// estimates.
    pub fn deploy(
        &self,
        owner: &Address,
        code: &[u8],
        address: &Address,
    ) -> Result<(), ContractError> {
        validate_wasm_code(code)?;

        let mut contracts = self.contracts.write();
        if contracts.contains_key(address) {
            return Err(ContractError::AlreadyExists(address.clone()));
        }

        let module = Module::new(&self.engine, code)
            .map_err(|e| ContractError::Compile(e.to_string()))?;
        // Instantiate once to surface import/start-section errors early.
        let mut store = self.bounded_store();
        Instance::new(&mut store, &module, &[])
            .map_err(|e| ContractError::Instantiate(e.to_string()))?;

        contracts.insert(
            address.clone(),
            ContractEntry {
                owner: owner.clone(),
                code: code.to_vec(),
                module,
                instruction_estimate: estimate_instructions(code),
                state_write_estimate: 1,
            },
        );
        Ok(())
    }

    /// Execute a contract call: instantiate within bounds, invoke the
    /// exported `handle` entry point, and report the cached estimates.
    pub fn execute(
        &self,
        _caller: &Address,
        contract: &Address,
    ) -> Result<ExecutionResult, ContractError> {
        let (module, instructions, state_writes) = {
            let contracts = self.contracts.read();
            let entry = contracts
                .get(contract)
                .ok_or_else(|| ContractError::NotFound(contract.clone()))?;
            (
                entry.module.clone(),
                entry.instruction_estimate,
                entry.state_write_estimate,
            )
        };

        let mut store = self.bounded_store();
        let instance = Instance::new(&mut store, &module, &[])
            .map_err(|e| ContractError::Instantiate(e.to_string()))?;

        let output = match instance.get_func(&mut store, ENTRY_POINT) {
            None => Vec::new(),
            Some(func) => {
                let result_count = func.ty(&store).results().len();
                let mut results = vec![Val::I32(0); result_count];
                func.call(&mut store, &[], &mut results)
                    .map_err(|e| ContractError::Execution(e.to_string()))?;
                match results.first() {
                    Some(Val::I32(v)) => (*v as u64).to_le_bytes().to_vec(),
                    Some(Val::I64(v)) => (*v as u64).to_le_bytes().to_vec(),
                    _ => Vec::new(),
                }
            }
        };

        Ok(ExecutionResult {
            output,
            instructions,
            state_writes,
        })
    }

    /// Cached instruction estimate for a deployed contract; 0 when unknown.
    pub fn estimate_call(&self, address: &Address) -> u64 {
        self.contracts
            .read()
            .get(address)
            .map(|e| e.instruction_estimate)
            .unwrap_or(0)
    }

    /// Cached state-write estimate for a deployed contract; 0 when unknown.
    pub fn estimate_state_writes(&self, address: &Address) -> u64 {
        self.contracts
            .read()
            .get(address)
            .map(|e| e.state_write_estimate)
            .unwrap_or(0)
    }

    pub fn has_contract(&self, address: &Address) -> bool {
        self.contracts.read().contains_key(address)
    }

    pub fn contract_code(&self, address: &Address) -> Option<Vec<u8>> {
        self.contracts.read().get(address).map(|e| e.code.clone())
    }

    pub fn contract_owner(&self, address: &Address) -> Option<Address> {
        self.contracts.read().get(address).map(|e| e.owner.clone())
    }

    fn bounded_store(&self) -> Store<StoreData> {
        let limits = StoreLimitsBuilder::new()
            .memory_size(MAX_MEMORY_BYTES)
            .instances(1)
            .build();
        let mut store = Store::new(&self.engine, StoreData { limits });
        store.limiter(|data| &mut data.limits);
        store
    }
}

/// Deterministic instruction estimate for a WASM module: the byte length of
/// its code. Consensus-critical; see the RC cost function.
pub fn estimate_instructions(code: &[u8]) -> u64 {
    code.len() as u64
}

/// Validate WASM bytecode: non-empty, correct magic, no float opcodes.
///
/// The float screen scans raw bytes, so it may reject some valid modules
/// whose data sections contain these byte values. It is deterministic, which
/// is the property consensus needs.
pub fn validate_wasm_code(code: &[u8]) -> Result<(), ContractError> {
    if code.is_empty() {
        return Err(ContractError::EmptyCode);
    }
    if code.len() < WASM_MAGIC.len() || code[..4] != WASM_MAGIC {
        return Err(ContractError::BadMagic);
    }
    if code.iter().any(|b| FLOAT_OPCODES.contains(b)) {
        return Err(ContractError::FloatOpcodes);
    }
    Ok(())
}
