pub mod error;
pub mod peer;
pub mod services;
pub mod wire;

pub use error::RudpError;
pub use peer::peer::AppMessage;
pub use peer::session::LinkInfo;
pub use peer::session::RudpConfig;
pub use services::client::RudpClient;
pub use services::conn::RudpConnection;
pub use services::resolve::IpMode;
pub use services::server::RudpServer;
