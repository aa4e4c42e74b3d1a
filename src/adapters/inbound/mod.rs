mod api_server;

pub use api_server::{client_identity, router, ApiServer, ApiState, RegisterRequest};
