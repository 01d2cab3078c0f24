#[derive(Debug)]
#[non_exhaustive]
pub(crate) enum ProxyCacheError {
    Io(std::io::Error),
    Hyper(hyper::Error),
    HyperUtil(hyper_util::client::legacy::Error),
    Http(hyper::http::Error),
    Sqlx(sqlx::Error),
    Tls(rustls::Error),
    Certificate(rcgen::Error),
    InvalidUri(String),
    Socks(&'static str),
}

impl std::fmt::Display for ProxyCacheError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(e) => e.fmt(f),
            Self::Hyper(e) => e.fmt(f),
            Self::HyperUtil(e) => e.fmt(f),
            Self::Http(e) => e.fmt(f),
            Self::Sqlx(e) => e.fmt(f),
            Self::Tls(e) => e.fmt(f),
            Self::Certificate(e) => e.fmt(f),
            Self::InvalidUri(uri) => write!(f, "Invalid target URI `{uri}`"),
            Self::Socks(msg) => write!(f, "SOCKS5 failure: {msg}"),
        }
    }
}

impl std::error::Error for ProxyCacheError {}

impl From<std::io::Error> for ProxyCacheError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<hyper::Error> for ProxyCacheError {
    fn from(value: hyper::Error) -> Self {
        Self::Hyper(value)
    }
}

impl From<hyper_util::client::legacy::Error> for ProxyCacheError {
    fn from(value: hyper_util::client::legacy::Error) -> Self {
        Self::HyperUtil(value)
    }
}

impl From<hyper::http::Error> for ProxyCacheError {
    fn from(value: hyper::http::Error) -> Self {
        Self::Http(value)
    }
}

impl From<sqlx::Error> for ProxyCacheError {
    fn from(value: sqlx::Error) -> Self {
        Self::Sqlx(value)
    }
}

impl From<rustls::Error> for ProxyCacheError {
    fn from(value: rustls::Error) -> Self {
        Self::Tls(value)
    }
}

impl From<rcgen::Error> for ProxyCacheError {
    fn from(value: rcgen::Error) -> Self {
        Self::Certificate(value)
    }
}
