//! The relay core: packet dispatch, override resolution, pool
//! reconciliation, the v6 reverse path, and the server-mode seam.

pub mod dispatcher;
pub mod logging;
pub mod override_engine;
pub mod pool;
pub mod reply;
pub mod update;

pub use dispatcher::RelayServer;
pub use dl_config::{Handler, HandlerError};
pub use logging::{LogHelper, LogMessage, RequestLogger};
pub use update::ServerPools;

/// Stable error identifiers carried in request log records.
pub const ERR_READ: &str = "ReadError";
pub const ERR_PANIC: &str = "Panic";
pub const ERR_PARSE: &str = "Parse";
pub const ERR_NO_SERVER: &str = "NoServer";
pub const ERR_CONNECT: &str = "ConnectError";
pub const ERR_WRITE: &str = "WriteError";
pub const ERR_ADMISSION: &str = "AdmissionExceeded";
