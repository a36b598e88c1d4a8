mod http;

pub use http::{AppState, SESSION_COOKIE, Server, TOKEN_HEADER, router};
