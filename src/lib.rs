pub mod ms_mix {
    tonic::include_proto!("ms_mix");
}

pub mod client;
pub mod config;
pub mod crypto;
pub mod error;
pub mod server;
