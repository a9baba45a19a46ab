//! Transaction lifecycle: state machine, intake and submission

pub mod intake;
pub mod machine;
mod sender;

pub use intake::{create_transaction, NewTransaction};
pub use sender::TransactionSender;
