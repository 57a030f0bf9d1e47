pub mod codec;
pub mod message;

/// Server name the proxy presents in prefixes and numerics.
/// Matches the backend network identity; clients see one coherent server.
pub const SERVER_NAME: &str = "jac.chat";

/// Version token advertised in the 004 reply.
pub const SERVER_VERSION: &str = "JAC-IRC-1.0";
