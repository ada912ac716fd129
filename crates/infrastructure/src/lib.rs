pub mod board_service;
pub mod challenge_service;
pub mod dynamodb;
pub mod dynamodb_store;
pub mod identity;
pub mod mailer;
pub mod memory;
pub mod models;
pub mod query_service;
pub mod store;

pub use board_service::*;
pub use challenge_service::*;
pub use dynamodb::*;
pub use dynamodb_store::*;
pub use identity::*;
pub use mailer::*;
pub use memory::*;
pub use models::*;
pub use query_service::*;
pub use store::*;
