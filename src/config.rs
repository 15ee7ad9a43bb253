#[derive(Clone)]
pub struct Config {
    pub listen_addr: String,
    pub listen_port: u16,
}

impl Config {
    pub fn load() -> Self {
        let listen_addr =
            std::env::var("LISTEN").unwrap_or_else(|_| "127.0.0.1".to_string());
        let listen_port = std::env::var("PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(8080);
        Self {
            listen_addr,
            listen_port,
        }
    }
}
