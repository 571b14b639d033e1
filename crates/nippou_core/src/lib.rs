pub mod domain;
pub mod ports;

pub use domain::{
    DocumentFields, DocumentPath, DocumentSnapshot, FieldValue, ReportDraft, SaveStatus,
    Session, SignInMethod, SyncPhase, UserId,
};
pub use ports::{
    AuthError, AuthResult, AuthService, DocumentStore, PortError, PortResult, SnapshotStream,
};
