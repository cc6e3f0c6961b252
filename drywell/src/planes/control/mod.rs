pub mod admin_operations;
pub(crate) mod janitor;
pub mod operation;

pub use operation::AdminOperations;
