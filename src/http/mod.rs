// HTTP module.
// Transport boundary plus status and body interpretation.

pub mod response;
pub mod transport;

pub use response::{ResponseOutcome, classify};
pub use transport::{HttpRequest, HttpResponse, ReqwestTransport, Transport};
