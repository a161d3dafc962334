use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("could not resolve `{path}`; tried: {}", .tried.join(", "))]
    Unresolved { path: String, tried: Vec<String> },
    #[error("no resolver registered for protocol `{0}`")]
    UnknownProtocol(String),
    #[error("i/o error reading `{path}`: {source}")]
    Io { path: String, #[source] source: std::io::Error },
}
