//! Common utilities and types shared across PassVault modules.
//!
//! This module provides the error taxonomy used by every layer of the
//! vault engine together with small foundational types.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{SensitiveBytes, VaultId};
