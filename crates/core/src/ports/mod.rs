mod ledger;
mod signature;

pub use ledger::*;
pub use signature::*;
