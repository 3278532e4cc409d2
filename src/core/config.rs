use serde::{Deserialize, Serialize};

/// Default port for both the TCP message listener and the UDP DHT socket.
pub const DEFAULT_PORT: u16 = 9999;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// TCP port the message listener binds (0 picks an ephemeral port).
    pub listen_port: u16,
    /// UDP port for DHT participation.
    pub dht_port: u16,
    /// STUN servers tried in order; the first mapped address wins.
    pub stun_servers: Vec<String>,
    /// Plaintext "what is my IP" endpoint used when every STUN server fails.
    pub ip_echo_url: String,
    /// Known overlay member to bootstrap against, as host:port.
    pub bootstrap_peer: Option<String>,
    /// Bound on outbound TCP dialing.
    pub connect_timeout_secs: u64,
    /// Bound on each STUN/DHT/HTTP request.
    pub request_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_port: DEFAULT_PORT,
            dht_port: DEFAULT_PORT,
            stun_servers: vec![
                "stun.l.google.com:19302".to_string(),
                "stun.ekiga.net:3478".to_string(),
                "stun.voipbuster.com:3478".to_string(),
                "stun.sipgate.net:3478".to_string(),
                "stun.nextcloud.com:3478".to_string(),
            ],
            ip_echo_url: "https://api.ipify.org".to_string(),
            bootstrap_peer: None,
            connect_timeout_secs: 5,
            request_timeout_secs: 3,
        }
    }
}
