pub mod db;
pub mod memory_auth;
pub mod memory_store;
pub mod password;

pub use db::DbAdapter;
pub use memory_auth::MemoryAuthService;
pub use memory_store::MemoryDocumentStore;
