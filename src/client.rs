use curve25519_dalek::constants::RISTRETTO_BASEPOINT_POINT;
use curve25519_dalek::ristretto::RistrettoPoint;
use curve25519_dalek::traits::Identity;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tonic::transport::Channel;
use tracing::info;

use elgamal_shuffle_lib::{encrypt, point_bytes, point_from_bytes, random_point, random_scalar};

use crate::config::{mask_size, BLOCK_SIZE, MAX_ROUNDS};
use crate::crypto::{hash_block, prg_advance, prg_seed, seal_onion, xor_into};
use crate::error::MixError;
use crate::ms_mix::mix_service_client::MixServiceClient;
use crate::ms_mix::{
    Block, ClientDh, ClientMask, Empty, KeyReadyRequest, RegisterRequest, Request, RequestArg,
    UpKey,
};

pub struct MixClient {
    id: u32,
    home: usize,
    n_servers: usize,
    n_clients: usize,
    conns: Vec<MixServiceClient<Channel>>,
    cum_pks: Vec<RistrettoPoint>,
    // marshalled key_points double as the per-server symmetric onion keys
    key_points: Vec<RistrettoPoint>,
    sym_keys: Vec<Vec<u8>>,
    // local mirror of the per-server mask/secret chains, [server][slot]
    masks: Vec<Vec<Vec<u8>>>,
    secrets: Vec<Vec<Vec<u8>>>,
}

impl MixClient {
    pub async fn connect(servers: &[String], home: usize) -> Result<MixClient, MixError> {
        if home >= servers.len() {
            return Err(MixError::ProtocolSequence(format!(
                "no such home server {home}"
            )));
        }
        let mut conns = Vec::with_capacity(servers.len());
        for addr in servers {
            let endpoint = format!("http://{addr}");
            let conn = loop {
                match MixServiceClient::connect(endpoint.clone()).await {
                    Ok(c) => break c,
                    Err(_) => tokio::time::sleep(std::time::Duration::from_millis(50)).await,
                }
            };
            conns.push(conn);
        }

        let mut pks = Vec::with_capacity(servers.len());
        for conn in &mut conns {
            let reply = conn.get_pk(Empty {}).await?.into_inner();
            pks.push(point_from_bytes(&reply.point)?);
        }
        // cum_pks[g] = pk_0 + ... + pk_g: the onion layer for server g is
        // encrypted under the cumulative key, peeled one share per hop.
        let mut cum_pks = Vec::with_capacity(pks.len());
        let mut acc = RistrettoPoint::identity();
        for pk in &pks {
            acc += pk;
            cum_pks.push(acc);
        }

        let mut rng = StdRng::from_os_rng();
        let key_points: Vec<RistrettoPoint> =
            (0..servers.len()).map(|_| random_point(&mut rng)).collect();
        let sym_keys = key_points.iter().map(point_bytes).collect();

        Ok(MixClient {
            id: 0,
            home,
            n_servers: servers.len(),
            n_clients: 0,
            conns,
            cum_pks,
            key_points,
            sym_keys,
            masks: Vec::new(),
            secrets: Vec::new(),
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn sym_key(&self, server: usize) -> &[u8] {
        &self.sym_keys[server]
    }

    // Ids are minted by server 0 so they stay unique across homes.
    pub async fn register(&mut self) -> Result<u32, MixError> {
        let reply = self.conns[0]
            .clone()
            .register(RegisterRequest {
                server_id: self.home as u32,
            })
            .await?
            .into_inner();
        self.id = reply.client_id;
        Ok(self.id)
    }

    pub async fn wait_registration(&mut self) -> Result<usize, MixError> {
        let reply = self.conns[0]
            .clone()
            .get_num_clients(Empty {})
            .await?
            .into_inner();
        self.n_clients = reply.num_clients as usize;
        Ok(self.n_clients)
    }

    pub async fn share_dh(&mut self) -> Result<(), MixError> {
        if self.n_clients == 0 {
            return Err(MixError::ProtocolSequence(
                "registration not finalized".into(),
            ));
        }
        let mut rng = StdRng::from_os_rng();
        self.masks = Vec::with_capacity(self.n_servers);
        self.secrets = Vec::with_capacity(self.n_servers);
        let mask_len = mask_size(self.n_clients);
        for s in 0..self.n_servers {
            let mask_secret = random_scalar(&mut rng);
            let dh = ClientDh {
                public: point_bytes(&(RISTRETTO_BASEPOINT_POINT * mask_secret)),
                id: self.id,
            };
            let reply = self.conns[s].clone().share_mask(dh).await?.into_inner();
            let server_pub = point_from_bytes(&reply.point)?;
            let seed = point_bytes(&(server_pub * mask_secret));
            self.masks.push(derive_chain(&seed, mask_len));

            let secret_secret = random_scalar(&mut rng);
            let dh = ClientDh {
                public: point_bytes(&(RISTRETTO_BASEPOINT_POINT * secret_secret)),
                id: self.id,
            };
            let reply = self.conns[s].clone().share_secret(dh).await?.into_inner();
            let server_pub = point_from_bytes(&reply.point)?;
            let seed = point_bytes(&(server_pub * secret_secret));
            self.secrets.push(derive_chain(&seed, BLOCK_SIZE));
        }
        Ok(())
    }

    pub async fn upload_keys(&mut self) -> Result<(), MixError> {
        let mut rng = StdRng::from_os_rng();
        let mut c1s = Vec::with_capacity(self.n_servers);
        let mut c2s = Vec::with_capacity(self.n_servers);
        for g in 0..self.n_servers {
            let ct = encrypt(&self.cum_pks[g], &self.key_points[g], &mut rng);
            c1s.push(point_bytes(&ct.a));
            c2s.push(point_bytes(&ct.b));
        }
        self.conns[0]
            .clone()
            .upload_keys(UpKey {
                c1s,
                c2s,
                id: self.id,
            })
            .await?;
        Ok(())
    }

    pub async fn wait_keys(&mut self) -> Result<(), MixError> {
        self.conns[0]
            .clone()
            .key_ready(KeyReadyRequest { id: self.id })
            .await?;
        Ok(())
    }

    pub async fn request(&mut self, round: u64, hash: &[u8]) -> Result<(), MixError> {
        let sealed = seal_onion(&self.sym_keys, round, hash)?;
        self.conns[self.home]
            .clone()
            .request_block(Request {
                hash: sealed,
                round,
                id: self.id,
            })
            .await?;
        Ok(())
    }

    pub async fn req_hashes(&mut self, round: u64) -> Result<Vec<Vec<u8>>, MixError> {
        let reply = self.conns[self.home]
            .clone()
            .get_req_hashes(RequestArg { id: self.id, round })
            .await?
            .into_inner();
        Ok(reply.hashes)
    }

    pub fn pad_block(payload: &[u8]) -> Result<Vec<u8>, MixError> {
        if payload.len() > BLOCK_SIZE {
            return Err(MixError::ProtocolSequence(format!(
                "payload exceeds block size: {}",
                payload.len()
            )));
        }
        let mut block = vec![0u8; BLOCK_SIZE];
        block[..payload.len()].copy_from_slice(payload);
        Ok(block)
    }

    pub async fn upload(&mut self, round: u64, payload: &[u8]) -> Result<Vec<u8>, MixError> {
        let block = Self::pad_block(payload)?;
        let sealed = seal_onion(&self.sym_keys, round, &block)?;
        self.conns[self.home]
            .clone()
            .upload_block(Block {
                block: sealed,
                round,
                id: self.id,
            })
            .await?;
        Ok(block)
    }

    pub async fn up_hashes(&mut self, round: u64) -> Result<Vec<Vec<u8>>, MixError> {
        let reply = self.conns[self.home]
            .clone()
            .get_up_hashes(RequestArg { id: self.id, round })
            .await?
            .into_inner();
        Ok(reply.hashes)
    }

    pub async fn download(&mut self, round: u64, position: usize) -> Result<Vec<u8>, MixError> {
        if self.masks.is_empty() {
            return Err(MixError::ProtocolSequence("dh chains not seeded".into()));
        }
        if position >= self.n_clients {
            return Err(MixError::ProtocolSequence(format!(
                "no such block position {position}"
            )));
        }
        let slot = (round % MAX_ROUNDS as u64) as usize;

        // The home mask completes the XOR of all per-server masks to the
        // unit vector selecting `position`.
        let mut mask = vec![0u8; mask_size(self.n_clients)];
        mask[position / 8] |= 1 << (position % 8);
        for s in 0..self.n_servers {
            if s != self.home {
                xor_into(&mut mask, &self.masks[s][slot]);
            }
        }

        let reply = self.conns[self.home]
            .clone()
            .get_response(ClientMask {
                id: self.id,
                mask,
                round,
            })
            .await?
            .into_inner();

        // Cancel every server's secret, then advance the local chains the
        // same way the servers advanced theirs this round.
        let mut block = reply.block;
        for s in 0..self.n_servers {
            xor_into(&mut block, &self.secrets[s][slot]);
            prg_advance(&mut self.secrets[s][slot]);
            if s != self.home {
                prg_advance(&mut self.masks[s][slot]);
            }
        }
        Ok(block)
    }
}

// Mirrors the server-side chain derivation.
fn derive_chain(seed: &[u8], len: usize) -> Vec<Vec<u8>> {
    let mut rows = Vec::with_capacity(MAX_ROUNDS);
    let mut prev = seed.to_vec();
    for _ in 0..MAX_ROUNDS {
        let mut row = vec![0u8; len];
        prg_seed(&prev, &mut row);
        prev = row.clone();
        rows.push(row);
    }
    rows
}

pub async fn run_client(servers: &[String], home: usize) -> Result<(), MixError> {
    let mut client = MixClient::connect(servers, home).await?;
    let id = client.register().await?;
    let total = client.wait_registration().await?;
    info!(id, total, "registered with cluster");

    client.share_dh().await?;
    client.upload_keys().await?;
    client.wait_keys().await?;
    info!(id, "key shuffle complete");

    let payload = format!("block from client {id}");
    let padded = MixClient::pad_block(payload.as_bytes())?;
    client.request(0, &hash_block(&padded)).await?;
    let _req_hashes = client.req_hashes(0).await?;

    client.upload(0, payload.as_bytes()).await?;
    let up_hashes = client.up_hashes(0).await?;
    let position = up_hashes
        .iter()
        .position(|h| h == &hash_block(&padded))
        .ok_or_else(|| MixError::ProtocolSequence("upload hash not found".into()))?;

    let block = client.download(0, position).await?;
    let ok = block == padded;
    info!(id, position, ok, "round complete");
    Ok(())
}
