mod balances;
mod conservation;
mod contracts;
mod indexer;
mod pipeline;
mod reconciliation;
mod resolver;
mod rewards;

pub use balances::*;
pub use conservation::*;
pub use contracts::*;
pub use indexer::*;
pub use pipeline::*;
pub use reconciliation::*;
pub use resolver::*;
pub use rewards::*;
