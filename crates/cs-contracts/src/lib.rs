//! Typed access to the sale contract and the stablecoin contract.
//!
//! Reads and writes are routed through the wallet of the current session, so
//! nothing here holds a node connection of its own.

pub mod amount;
pub mod bindings;
mod gateway;
#[cfg(any(test, feature = "simulator"))]
pub mod simulator;
mod tx;

use alloy_primitives::{Address, address};
use serde::{Deserialize, Serialize};

pub use gateway::ContractGateway;
pub use tx::{ConfirmationPolicy, TransactionHandle};

pub const DEFAULT_SALE_CONTRACT: Address = address!("0x45CbCA5f88c510526049F31cECeF626Eb5254784");
pub const DEFAULT_STABLECOIN_CONTRACT: Address =
    address!("0x55d398326f99059fF775485246999027B3197955");

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ContractAddresses {
    pub sale: Address,
    pub stablecoin: Address,
}

impl Default for ContractAddresses {
    fn default() -> Self {
        Self {
            sale: DEFAULT_SALE_CONTRACT,
            stablecoin: DEFAULT_STABLECOIN_CONTRACT,
        }
    }
}
