pub mod fjall;
pub mod keys;
pub mod mem;
pub mod traits;
pub mod types;

pub use traits::{ContainerStore, DeleteTransactionLog};
pub use types::TxnLogState;
