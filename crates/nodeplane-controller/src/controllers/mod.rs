//! Sample controllers wired into `machined`.

pub mod k8s;
pub mod secrets;
pub mod siderolink;

pub use k8s::NodenameController;
pub use secrets::KubeletController;
pub use siderolink::ConfigController;
