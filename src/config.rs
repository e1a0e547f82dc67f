use std::fs;
use std::io;
use std::path::Path;
use std::time::Duration;

pub const BLOCK_SIZE: usize = 1024;

pub const SECRET_SIZE: usize = 32;

pub const MAX_ROUNDS: usize = 2;

pub const SERVER_PORT: u16 = 8000;

pub fn mask_size(num_clients: usize) -> usize {
    (num_clients / SECRET_SIZE) * SECRET_SIZE + SECRET_SIZE
}

pub fn parse_server_list(path: impl AsRef<Path>) -> io::Result<Vec<String>> {
    let contents = fs::read_to_string(path)?;
    Ok(contents
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect())
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub id: usize,
    pub servers: Vec<String>,
    pub total_clients: usize,
    pub rendezvous_timeout: Duration,
}

impl ServerConfig {
    pub fn new(id: usize, servers: Vec<String>, total_clients: usize) -> Self {
        ServerConfig {
            id,
            servers,
            total_clients,
            rendezvous_timeout: Duration::from_secs(300),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_size_covers_client_bits() {
        assert_eq!(mask_size(1), SECRET_SIZE);
        assert_eq!(mask_size(31), SECRET_SIZE);
        assert_eq!(mask_size(32), 2 * SECRET_SIZE);
        assert_eq!(mask_size(100), 4 * SECRET_SIZE);
        // At least one bit per client.
        for c in 1..500 {
            assert!(mask_size(c) * 8 >= c);
        }
    }
}
