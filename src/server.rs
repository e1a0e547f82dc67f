use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex, OnceLock};
use std::time::Instant;

use curve25519_dalek::constants::RISTRETTO_BASEPOINT_POINT;
use curve25519_dalek::ristretto::RistrettoPoint;
use curve25519_dalek::scalar::Scalar;
use futures::future::join_all;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;
use tokio::sync::{mpsc, Mutex, RwLock, Semaphore};
use tonic::transport::Channel;
use tonic::{Response, Status};
use tracing::{debug, error, info};

use elgamal_shuffle_lib::{
    peel, point_bytes, point_from_bytes, random_permutation, random_scalar, shuffle, verify,
    Ciphertext, ShuffleProof,
};

use crate::config::{mask_size, ServerConfig, BLOCK_SIZE, MAX_ROUNDS};
use crate::crypto::{compute_response, hash_block, open_layer, prg_advance, prg_seed, xor_into};
use crate::error::MixError;
use crate::ms_mix::mix_service_client::MixServiceClient;
use crate::ms_mix::mix_service_server::{MixService, MixServiceServer};
use crate::ms_mix::{
    AuxKeyProof, Block, BlockList, ClientBlock, ClientDh, ClientMask, ClientRegistration,
    CorrectReply, Empty, HashList, InternalKey, KeyReadyRequest, NumClientsReply, PointReply,
    PointRow, RegisterDoneRequest, RegisterReply, RegisterRequest, Request, RequestArg,
    RequestList, ResponseReply, UpKey,
};

// One onion layer per remaining hop, in flight toward the shuffle stage.
struct KeyBatch {
    xss: Vec<PointRow>,
    yss: Vec<PointRow>,
}

struct RegState {
    next_id: usize,
}

struct RoundState {
    // Request pipeline.
    req_tx: Vec<mpsc::Sender<Request>>,
    req_rx: Mutex<Vec<mpsc::Receiver<Request>>>,
    requests_tx: mpsc::Sender<Vec<Request>>,
    requests_rx: Mutex<mpsc::Receiver<Vec<Request>>>,
    req_hashes: RwLock<Vec<Vec<u8>>>,
    req_hashes_rdy: Vec<Semaphore>,

    // Upload pipeline.
    ublock_tx: Vec<mpsc::Sender<Block>>,
    ublock_rx: Mutex<Vec<mpsc::Receiver<Block>>>,
    shuffle_tx: mpsc::Sender<Vec<Block>>,
    shuffle_rx: Mutex<mpsc::Receiver<Vec<Block>>>,
    up_hashes: RwLock<Vec<Vec<u8>>>,
    up_hashes_rdy: Vec<Semaphore>,

    // Download engine.
    all_blocks: RwLock<Vec<Vec<u8>>>,
    dblocks_tx: mpsc::Sender<Vec<Block>>,
    dblocks_rx: Mutex<mpsc::Receiver<Vec<Block>>>,
    blocks_rdy: Vec<Semaphore>,
    xors_tx: Vec<Vec<mpsc::Sender<Block>>>,
    xors_rx: Vec<Vec<Mutex<mpsc::Receiver<Block>>>>,
}

impl RoundState {
    fn new(n_servers: usize, n_clients: usize) -> RoundState {
        let (requests_tx, requests_rx) = mpsc::channel(1);
        let (shuffle_tx, shuffle_rx) = mpsc::channel(1);
        let (dblocks_tx, dblocks_rx) = mpsc::channel(1);

        let mut req_tx = Vec::with_capacity(n_clients);
        let mut req_rx = Vec::with_capacity(n_clients);
        let mut ublock_tx = Vec::with_capacity(n_clients);
        let mut ublock_rx = Vec::with_capacity(n_clients);
        for _ in 0..n_clients {
            let (tx, rx) = mpsc::channel(1);
            req_tx.push(tx);
            req_rx.push(rx);
            let (tx, rx) = mpsc::channel(1);
            ublock_tx.push(tx);
            ublock_rx.push(rx);
        }

        let mut xors_tx = Vec::with_capacity(n_servers);
        let mut xors_rx = Vec::with_capacity(n_servers);
        for _ in 0..n_servers {
            let mut txs = Vec::with_capacity(n_clients);
            let mut rxs = Vec::with_capacity(n_clients);
            for _ in 0..n_clients {
                let (tx, rx) = mpsc::channel(1);
                txs.push(tx);
                rxs.push(Mutex::new(rx));
            }
            xors_tx.push(txs);
            xors_rx.push(rxs);
        }

        RoundState {
            req_tx,
            req_rx: Mutex::new(req_rx),
            requests_tx,
            requests_rx: Mutex::new(requests_rx),
            req_hashes: RwLock::new(Vec::new()),
            req_hashes_rdy: (0..n_clients).map(|_| Semaphore::new(0)).collect(),
            ublock_tx,
            ublock_rx: Mutex::new(ublock_rx),
            shuffle_tx,
            shuffle_rx: Mutex::new(shuffle_rx),
            up_hashes: RwLock::new(Vec::new()),
            up_hashes_rdy: (0..n_clients).map(|_| Semaphore::new(0)).collect(),
            all_blocks: RwLock::new(Vec::new()),
            dblocks_tx,
            dblocks_rx: Mutex::new(dblocks_rx),
            blocks_rdy: (0..n_clients).map(|_| Semaphore::new(0)).collect(),
            xors_tx,
            xors_rx,
        }
    }
}

struct SharedState {
    n_clients: usize,
    pi: Vec<usize>,
    keys: RwLock<Vec<Vec<u8>>>,
    keys_rdy: Semaphore,
    masks: Vec<Vec<StdMutex<Vec<u8>>>>,
    secrets: Vec<Vec<StdMutex<Vec<u8>>>>,
    key_upload_tx: mpsc::Sender<UpKey>,
    key_upload_rx: Mutex<mpsc::Receiver<UpKey>>,
    key_shuffle_tx: mpsc::Sender<KeyBatch>,
    key_shuffle_rx: Mutex<mpsc::Receiver<KeyBatch>>,
    aux_tx: Vec<mpsc::Sender<AuxKeyProof>>,
    aux_rx: Vec<Mutex<mpsc::Receiver<AuxKeyProof>>>,
    rounds: Vec<RoundState>,
}

impl SharedState {
    fn new(n_servers: usize, n_clients: usize) -> SharedState {
        let mut rng = StdRng::from_os_rng();
        let pi = random_permutation(n_clients, &mut rng);

        let rows = |len: usize| {
            (0..MAX_ROUNDS)
                .map(|_| {
                    (0..n_clients)
                        .map(|_| StdMutex::new(vec![0u8; len]))
                        .collect()
                })
                .collect::<Vec<Vec<StdMutex<Vec<u8>>>>>()
        };

        let (key_upload_tx, key_upload_rx) = mpsc::channel(n_clients.max(1));
        let (key_shuffle_tx, key_shuffle_rx) = mpsc::channel(1);
        let mut aux_tx = Vec::with_capacity(n_servers);
        let mut aux_rx = Vec::with_capacity(n_servers);
        for _ in 0..n_servers {
            let (tx, rx) = mpsc::channel(n_servers);
            aux_tx.push(tx);
            aux_rx.push(Mutex::new(rx));
        }

        SharedState {
            n_clients,
            pi,
            keys: RwLock::new(vec![Vec::new(); n_clients]),
            keys_rdy: Semaphore::new(0),
            masks: rows(mask_size(n_clients)),
            secrets: rows(BLOCK_SIZE),
            key_upload_tx,
            key_upload_rx: Mutex::new(key_upload_rx),
            key_shuffle_tx,
            key_shuffle_rx: Mutex::new(key_shuffle_rx),
            aux_tx,
            aux_rx,
            rounds: (0..MAX_ROUNDS)
                .map(|_| RoundState::new(n_servers, n_clients))
                .collect(),
        }
    }
}

pub struct MixServer {
    cfg: ServerConfig,
    sk: Scalar,
    pk: RistrettoPoint,
    pk_bin: Vec<u8>,
    eph_secret: Scalar,
    dh_lock: Mutex<()>,
    peers: OnceLock<Vec<MixServiceClient<Channel>>>,
    next_pks: OnceLock<Vec<RistrettoPoint>>,
    next_pks_bin: OnceLock<Vec<Vec<u8>>>,
    reg: Mutex<RegState>,
    client_map: RwLock<HashMap<usize, usize>>,
    reg_tx: mpsc::Sender<()>,
    reg_rx: Mutex<mpsc::Receiver<()>>,
    reg_done: Semaphore,
    running: Semaphore,
    shared: OnceLock<Arc<SharedState>>,
}

impl MixServer {
    pub fn new(cfg: ServerConfig) -> Arc<MixServer> {
        let mut rng = StdRng::from_os_rng();
        let sk = random_scalar(&mut rng);
        let pk = RISTRETTO_BASEPOINT_POINT * sk;
        let eph_secret = random_scalar(&mut rng);
        let (reg_tx, reg_rx) = mpsc::channel(cfg.total_clients.max(1));
        Arc::new(MixServer {
            pk_bin: point_bytes(&pk),
            cfg,
            sk,
            pk,
            eph_secret,
            dh_lock: Mutex::new(()),
            peers: OnceLock::new(),
            next_pks: OnceLock::new(),
            next_pks_bin: OnceLock::new(),
            reg: Mutex::new(RegState { next_id: 0 }),
            client_map: RwLock::new(HashMap::new()),
            reg_tx,
            reg_rx: Mutex::new(reg_rx),
            reg_done: Semaphore::new(0),
            running: Semaphore::new(0),
            shared: OnceLock::new(),
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.cfg
    }

    fn n_servers(&self) -> usize {
        self.cfg.servers.len()
    }

    fn shared(&self) -> Result<&Arc<SharedState>, MixError> {
        self.shared
            .get()
            .ok_or_else(|| MixError::ProtocolSequence("registration not finalized".into()))
    }

    fn peers(&self) -> Result<&Vec<MixServiceClient<Channel>>, MixError> {
        self.peers
            .get()
            .ok_or_else(|| MixError::ProtocolSequence("cluster not connected".into()))
    }

    fn peer(&self, id: usize) -> Result<MixServiceClient<Channel>, MixError> {
        self.peers()?
            .get(id)
            .cloned()
            .ok_or_else(|| MixError::ProtocolSequence(format!("no such server {id}")))
    }

    async fn with_deadline<T>(&self, fut: impl Future<Output = T>) -> Result<T, MixError> {
        tokio::time::timeout(self.cfg.rendezvous_timeout, fut)
            .await
            .map_err(|_| MixError::Deadline)
    }

    async fn broadcast<T, F, Fut>(&self, f: F) -> Result<(), MixError>
    where
        F: Fn(MixServiceClient<Channel>) -> Fut,
        Fut: Future<Output = Result<T, Status>>,
    {
        let peers = self.peers()?;
        for res in join_all(peers.iter().cloned().map(f)).await {
            res?;
        }
        Ok(())
    }

    // --- Setup ---

    pub async fn connect_servers(self: &Arc<Self>) -> Result<(), MixError> {
        let mut peers = Vec::with_capacity(self.n_servers());
        for addr in &self.cfg.servers {
            let endpoint = format!("http://{addr}");
            let client = loop {
                match MixServiceClient::connect(endpoint.clone()).await {
                    Ok(c) => break c,
                    Err(_) => tokio::time::sleep(std::time::Duration::from_millis(50)).await,
                }
            };
            peers.push(client);
        }

        let fetches = peers.iter().cloned().map(|mut peer| async move {
            let reply = peer.get_pk(Empty {}).await?.into_inner();
            Ok::<Vec<u8>, Status>(reply.point)
        });
        let mut pks = Vec::with_capacity(self.n_servers());
        for res in join_all(fetches).await {
            pks.push(point_from_bytes(&res?)?);
        }

        // next_pks[i] = pk_id + pk_{id+1} + ... + pk_{id+i}
        let left = self.n_servers() - self.cfg.id;
        let mut next_pks = Vec::with_capacity(left);
        let mut acc = self.pk;
        for i in 0..left {
            if i > 0 {
                acc += pks[self.cfg.id + i];
            }
            next_pks.push(acc);
        }
        let next_pks_bin = next_pks.iter().map(point_bytes).collect();

        let _ = self.next_pks.set(next_pks);
        let _ = self.next_pks_bin.set(next_pks_bin);
        let _ = self.peers.set(peers);
        Ok(())
    }

    pub async fn wait_ready(&self) {
        while self.peers.get().is_none() {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    }

    fn spawn_rounds<F, Fut>(self: &Arc<Self>, slots: u64, f: F)
    where
        F: Fn(Arc<MixServer>, u64) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = Result<(), MixError>> + Send + 'static,
    {
        for slot in 0..slots {
            let server = self.clone();
            let f = f.clone();
            tokio::spawn(async move {
                let mut round = slot;
                loop {
                    if let Err(e) = f(server.clone(), round).await {
                        error!(server = server.cfg.id, round, error = %e, "pipeline halted");
                        return;
                    }
                    round += slots;
                }
            });
        }
    }

    pub async fn run_handlers(self: Arc<Self>) {
        match self.reg_done.acquire().await {
            Ok(permit) => permit.forget(),
            Err(_) => return,
        }

        self.spawn_rounds(1, |s, r| async move { s.gather_keys(r).await });
        self.spawn_rounds(1, |s, r| async move { s.shuffle_keys(r).await });

        let rounds = MAX_ROUNDS as u64;
        self.spawn_rounds(rounds, |s, r| async move { s.gather_requests(r).await });
        self.spawn_rounds(rounds, |s, r| async move { s.shuffle_requests(r).await });
        self.spawn_rounds(rounds, |s, r| async move { s.gather_uploads(r).await });
        self.spawn_rounds(rounds, |s, r| async move { s.shuffle_uploads(r).await });
        self.spawn_rounds(rounds, |s, r| async move { s.handle_responses(r).await });

        self.running.add_permits(1);
        info!(server = self.cfg.id, "handlers running");
    }

    // --- Registration ---

    async fn handle_register(&self, home_sid: usize) -> Result<u32, MixError> {
        if home_sid >= self.n_servers() {
            return Err(MixError::ProtocolSequence(format!(
                "no such home server {home_sid}"
            )));
        }
        let mut reg = self.reg.lock().await;
        let id = reg.next_id as u32;
        reg.next_id += 1;
        let minted = reg.next_id;

        let record = ClientRegistration {
            server_id: home_sid as u32,
            id,
        };
        for peer in self.peers()? {
            peer.clone().register2(record.clone()).await?;
        }
        if minted == self.cfg.total_clients {
            self.register_done().await?;
        }
        info!(server = self.cfg.id, client = id, "registered");
        Ok(id)
    }

    async fn register_done(&self) -> Result<(), MixError> {
        let done = RegisterDoneRequest {
            num_clients: self.cfg.total_clients as u32,
        };
        for peer in self.peers()? {
            peer.clone().register_done2(done.clone()).await?;
        }
        for _ in 0..self.cfg.total_clients {
            self.reg_tx.send(()).await.map_err(|_| MixError::closed())?;
        }
        Ok(())
    }

    async fn handle_register2(&self, rec: ClientRegistration) -> Result<(), MixError> {
        let mut map = self.client_map.write().await;
        if map.contains_key(&(rec.id as usize)) {
            return Err(MixError::RegistrationCollision(rec.id));
        }
        map.insert(rec.id as usize, rec.server_id as usize);
        Ok(())
    }

    async fn handle_register_done2(&self, num_clients: usize) -> Result<(), MixError> {
        let st = Arc::new(SharedState::new(self.n_servers(), num_clients));
        self.shared
            .set(st)
            .map_err(|_| MixError::ProtocolSequence("registration already finalized".into()))?;
        self.reg_done.add_permits(1);
        // Reply only once the handler pipelines are live.
        match self.running.acquire().await {
            Ok(permit) => permit.forget(),
            Err(_) => return Err(MixError::closed()),
        }
        info!(server = self.cfg.id, num_clients, "register done");
        Ok(())
    }

    // --- Key shuffle ---

    async fn gather_keys(self: Arc<Self>, _round: u64) -> Result<(), MixError> {
        let st = self.shared()?.clone();
        let n = st.n_clients;
        let layer_count = self.n_servers() - self.cfg.id;

        let mut bundles: Vec<Option<UpKey>> = vec![None; n];
        {
            let mut rx = st.key_upload_rx.lock().await;
            for _ in 0..n {
                let key = rx.recv().await.ok_or_else(MixError::closed)?;
                let id = key.id as usize;
                if id >= n {
                    return Err(MixError::ProtocolSequence(format!("bad client id {id}")));
                }
                bundles[id] = Some(key);
            }
        }

        let mut xss = Vec::with_capacity(layer_count);
        let mut yss = Vec::with_capacity(layer_count);
        for l in 0..layer_count {
            let mut xs = Vec::with_capacity(n);
            let mut ys = Vec::with_capacity(n);
            for bundle in &bundles {
                let bundle = bundle
                    .as_ref()
                    .ok_or_else(|| MixError::ProtocolSequence("duplicate key upload".into()))?;
                if bundle.c1s.len() != layer_count || bundle.c2s.len() != layer_count {
                    return Err(MixError::ProtocolSequence("bad onion depth".into()));
                }
                xs.push(bundle.c1s[l].clone());
                ys.push(bundle.c2s[l].clone());
            }
            xss.push(PointRow { points: xs });
            yss.push(PointRow { points: ys });
        }

        let aux = AuxKeyProof {
            xss: xss.clone(),
            yss: yss.clone(),
            sid: self.cfg.id as u32,
        };
        self.broadcast(|mut peer| {
            let aux = aux.clone();
            async move { peer.put_aux_proof(aux).await }
        })
        .await?;

        st.key_shuffle_tx
            .send(KeyBatch { xss, yss })
            .await
            .map_err(|_| MixError::closed())
    }

    async fn shuffle_keys(self: Arc<Self>, _round: u64) -> Result<(), MixError> {
        let st = self.shared()?.clone();
        let batch = st
            .key_shuffle_rx
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(MixError::closed)?;

        let n = st.n_clients;
        let layer_count = self.n_servers() - self.cfg.id;
        if batch.xss.len() != layer_count || batch.yss.len() != layer_count {
            return Err(MixError::ProtocolSequence(
                "bad layer count in key batch".into(),
            ));
        }
        let next_pks = self
            .next_pks
            .get()
            .ok_or_else(|| MixError::ProtocolSequence("cluster not connected".into()))?;

        let t = Instant::now();
        let layers: Vec<Vec<Ciphertext>> = (0..layer_count)
            .map(|l| decode_cts(&batch.xss[l], &batch.yss[l], n))
            .collect::<Result<_, _>>()?;

        let outs: Vec<(Vec<Ciphertext>, ShuffleProof, Vec<RistrettoPoint>)> = layers
            .par_iter()
            .enumerate()
            .map(|(l, layer)| {
                let mut rng = StdRng::from_os_rng();
                let (outputs, proof) = shuffle(&st.pi, &next_pks[l], layer, &mut rng)?;
                let decs = outputs.iter().map(|ct| peel(ct, &self.sk)).collect();
                Ok((outputs, proof, decs))
            })
            .collect::<Result<_, MixError>>()?;

        // Whatever sits in layer 0 is this server's own key material.
        {
            let mut keys = st.keys.write().await;
            for (c, point) in outs[0].2.iter().enumerate() {
                keys[c] = point_bytes(point);
            }
        }

        let next_pks_bin = self
            .next_pks_bin
            .get()
            .ok_or_else(|| MixError::ProtocolSequence("cluster not connected".into()))?;
        let base_bin = point_bytes(&RISTRETTO_BASEPOINT_POINT);
        let mut ik = InternalKey {
            xss: Vec::with_capacity(layer_count),
            yss: Vec::with_capacity(layer_count),
            sid: self.cfg.id as u32,
            ybarss: Vec::with_capacity(layer_count),
            proofs: Vec::with_capacity(layer_count),
            keys: next_pks_bin.clone(),
        };
        for (l, (outputs, proof, decs)) in outs.iter().enumerate() {
            ik.xss.push(PointRow {
                points: outputs.iter().map(|ct| point_bytes(&ct.a)).collect(),
            });
            // The extracted layer is erased from the onward payload.
            let ys = if l == 0 {
                vec![base_bin.clone(); n]
            } else {
                decs.iter().map(point_bytes).collect()
            };
            ik.yss.push(PointRow { points: ys });
            ik.ybarss.push(PointRow {
                points: outputs.iter().map(|ct| point_bytes(&ct.b)).collect(),
            });
            ik.proofs.push(proof.to_bytes());
        }
        info!(server = self.cfg.id, elapsed = ?t.elapsed(), "key shuffle done");

        self.broadcast(|mut peer| {
            let ik = ik.clone();
            async move {
                let reply = peer.share_server_keys(ik).await?.into_inner();
                if !reply.correct {
                    return Err(Status::failed_precondition("peer rejected key shuffle"));
                }
                Ok(())
            }
        })
        .await
    }

    async fn handle_share_server_keys(&self, ik: InternalKey) -> Result<bool, MixError> {
        let st = self.shared()?.clone();
        let sid = ik.sid as usize;
        let n_servers = self.n_servers();
        if sid >= n_servers {
            return Err(MixError::ProtocolSequence(format!("bad server id {sid}")));
        }

        let aux = st.aux_rx[sid]
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(MixError::closed)?;
        self.verify_shuffle(&ik, &aux)?;

        // The tail layers are what the next prover will claim as inputs.
        if sid != n_servers - 1 {
            let next = AuxKeyProof {
                xss: ik.xss[1..].to_vec(),
                yss: ik.yss[1..].to_vec(),
                sid: (sid + 1) as u32,
            };
            st.aux_tx[sid + 1]
                .send(next)
                .await
                .map_err(|_| MixError::closed())?;
        }

        if sid == n_servers - 1 && self.cfg.id == 0 {
            st.keys_rdy.add_permits(st.n_clients);
        } else if sid + 1 == self.cfg.id {
            let batch = KeyBatch {
                xss: ik.xss[1..].to_vec(),
                yss: ik.yss[1..].to_vec(),
            };
            st.key_shuffle_tx
                .send(batch)
                .await
                .map_err(|_| MixError::closed())?;
        }
        Ok(true)
    }

    fn verify_shuffle(&self, ik: &InternalKey, aux: &AuxKeyProof) -> Result<(), MixError> {
        let layer_count = aux.xss.len();
        if ik.xss.len() != layer_count
            || ik.ybarss.len() != layer_count
            || ik.proofs.len() != layer_count
            || ik.keys.len() != layer_count
            || aux.yss.len() != layer_count
        {
            return Err(MixError::ProtocolSequence(
                "mismatched key shuffle layers".into(),
            ));
        }
        let st = self.shared()?;
        let n = st.n_clients;
        let sid = ik.sid as usize;
        for l in 0..layer_count {
            let pk = point_from_bytes(&ik.keys[l])?;
            let inputs = decode_cts(&aux.xss[l], &aux.yss[l], n)?;
            let outputs = decode_cts(&ik.xss[l], &ik.ybarss[l], n)?;
            let proof = ShuffleProof::from_bytes(&ik.proofs[l])?;
            verify(&pk, &inputs, &outputs, &proof).map_err(|_| MixError::ShuffleProof { sid })?;
        }
        Ok(())
    }

    // --- Request pipeline ---

    async fn gather_requests(self: Arc<Self>, round: u64) -> Result<(), MixError> {
        let st = self.shared()?.clone();
        let rs = &st.rounds[slot_of(round)];
        let mut all = {
            let mut rxs = rs.req_rx.lock().await;
            let received = join_all(rxs.iter_mut().map(|rx| rx.recv())).await;
            received
                .into_iter()
                .map(|r| r.ok_or_else(MixError::closed))
                .collect::<Result<Vec<Request>, _>>()?
        };
        for req in &mut all {
            req.id = 0;
        }
        rs.requests_tx
            .send(all)
            .await
            .map_err(|_| MixError::closed())
    }

    async fn shuffle_requests(self: Arc<Self>, round: u64) -> Result<(), MixError> {
        let st = self.shared()?.clone();
        let rs = &st.rounds[slot_of(round)];
        let all = rs
            .requests_rx
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(MixError::closed)?;
        if all.len() != st.n_clients {
            return Err(MixError::ProtocolSequence("short request batch".into()));
        }

        let mut input: Vec<Vec<u8>> = (0..st.n_clients)
            .map(|i| all[st.pi[i]].hash.clone())
            .collect();
        self.open_batch(&st, &mut input, round).await?;
        let reqs: Vec<Request> = input
            .into_iter()
            .map(|hash| Request { hash, round, id: 0 })
            .collect();

        let t = Instant::now();
        if self.cfg.id == self.n_servers() - 1 {
            self.broadcast(|mut peer| {
                let list = RequestList {
                    requests: reqs.clone(),
                };
                async move { peer.put_plain_requests(list).await }
            })
            .await?;
        } else {
            let mut next = self.peer(self.cfg.id + 1)?;
            next.share_server_requests(RequestList { requests: reqs })
                .await?;
        }
        debug!(server = self.cfg.id, round, elapsed = ?t.elapsed(), "request shuffle forwarded");
        Ok(())
    }

    // --- Upload pipeline ---

    async fn gather_uploads(self: Arc<Self>, round: u64) -> Result<(), MixError> {
        let st = self.shared()?.clone();
        let rs = &st.rounds[slot_of(round)];
        let mut all = {
            let mut rxs = rs.ublock_rx.lock().await;
            let received = join_all(rxs.iter_mut().map(|rx| rx.recv())).await;
            received
                .into_iter()
                .map(|b| b.ok_or_else(MixError::closed))
                .collect::<Result<Vec<Block>, _>>()?
        };
        for block in &mut all {
            block.id = 0;
        }
        rs.shuffle_tx.send(all).await.map_err(|_| MixError::closed())
    }

    async fn shuffle_uploads(self: Arc<Self>, round: u64) -> Result<(), MixError> {
        let st = self.shared()?.clone();
        let rs = &st.rounds[slot_of(round)];
        let all = rs
            .shuffle_rx
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(MixError::closed)?;
        if all.len() != st.n_clients {
            return Err(MixError::ProtocolSequence("short upload batch".into()));
        }

        let mut input: Vec<Vec<u8>> = (0..st.n_clients)
            .map(|i| all[st.pi[i]].block.clone())
            .collect();
        self.open_batch(&st, &mut input, round).await?;
        let uploads: Vec<Block> = input
            .into_iter()
            .map(|block| Block { block, round, id: 0 })
            .collect();

        let t = Instant::now();
        if self.cfg.id == self.n_servers() - 1 {
            self.broadcast(|mut peer| {
                let list = BlockList {
                    blocks: uploads.clone(),
                };
                async move { peer.put_plain_blocks(list).await }
            })
            .await?;
        } else {
            let mut next = self.peer(self.cfg.id + 1)?;
            next.share_server_blocks(BlockList { blocks: uploads })
                .await?;
        }
        info!(server = self.cfg.id, round, elapsed = ?t.elapsed(), "upload shuffle forwarded");
        Ok(())
    }

    async fn open_batch(
        &self,
        st: &SharedState,
        input: &mut [Vec<u8>],
        round: u64,
    ) -> Result<(), MixError> {
        let keys = st.keys.read().await;
        input.par_iter_mut().enumerate().try_for_each(|(i, item)| {
            let plain = open_layer(&keys[i], round, item, i)?;
            *item = plain;
            Ok(())
        })
    }

    // --- Download engine ---

    async fn handle_responses(self: Arc<Self>, round: u64) -> Result<(), MixError> {
        let st = self.shared()?.clone();
        let slot = slot_of(round);
        let rs = &st.rounds[slot];
        let blocks = rs
            .dblocks_rx
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(MixError::closed)?;
        let payloads: Vec<Vec<u8>> = blocks.into_iter().map(|b| b.block).collect();
        *rs.all_blocks.write().await = payloads.clone();

        let t = Instant::now();
        let cmap = self.client_map.read().await.clone();
        let mut sends = Vec::new();
        // Remote clients' rows advance here; a local client's secret
        // advances in GetResponse and its mask row is never read.
        for c in 0..st.n_clients {
            let home = *cmap
                .get(&c)
                .ok_or_else(|| MixError::ProtocolSequence(format!("unmapped client {c}")))?;
            if home == self.cfg.id {
                continue;
            }
            let resp = {
                let mut mask = st.masks[slot][c].lock().expect("mask row lock");
                let mut secret = st.secrets[slot][c].lock().expect("secret row lock");
                let resp = compute_response(&payloads, &mask, &secret);
                prg_advance(&mut secret);
                prg_advance(&mut mask);
                resp
            };
            let cb = ClientBlock {
                cid: c as u32,
                sid: self.cfg.id as u32,
                block: Some(Block {
                    block: resp,
                    round,
                    id: 0,
                }),
            };
            let mut peer = self.peer(home)?;
            sends.push(async move { peer.put_client_block(cb).await });
        }
        for res in join_all(sends).await {
            res?;
        }
        debug!(server = self.cfg.id, round, elapsed = ?t.elapsed(), "pir contributions pushed");

        for c in 0..st.n_clients {
            if cmap.get(&c) == Some(&self.cfg.id) {
                rs.blocks_rdy[c].add_permits(1);
            }
        }
        Ok(())
    }

    async fn handle_get_response(&self, cm: ClientMask) -> Result<Vec<u8>, MixError> {
        let st = self.shared()?.clone();
        let slot = slot_of(cm.round);
        let rs = &st.rounds[slot];
        let id = cm.id as usize;
        if id >= st.n_clients {
            return Err(MixError::ProtocolSequence(format!("bad client id {id}")));
        }

        let t = Instant::now();
        // N-1 remote contributions, one per peer.
        let waits = (0..self.n_servers())
            .filter(|&i| i != self.cfg.id)
            .map(|i| {
                let rx = &rs.xors_rx[i][id];
                async move { rx.lock().await.recv().await }
            });
        let others = self.with_deadline(join_all(waits)).await?;
        let others: Vec<Block> = others
            .into_iter()
            .map(|b| b.ok_or_else(MixError::closed))
            .collect::<Result<_, _>>()?;

        match self.with_deadline(rs.blocks_rdy[id].acquire()).await? {
            Ok(permit) => permit.forget(),
            Err(_) => return Err(MixError::closed()),
        }
        debug!(server = self.cfg.id, client = id, round = cm.round, elapsed = ?t.elapsed(),
            "download rendezvous complete");

        let all_blocks = rs.all_blocks.read().await;
        let mut resp = {
            let mut secret = st.secrets[slot][id].lock().expect("secret row lock");
            let resp = compute_response(&all_blocks, &cm.mask, &secret);
            prg_advance(&mut secret);
            resp
        };
        drop(all_blocks);
        for other in &others {
            xor_into(&mut resp, &other.block);
        }
        Ok(resp)
    }

    // --- DH chain seeding ---

    // Row r seeds from row r-1; the client derives the same rows from the
    // shared DH point.
    async fn share_chain(
        &self,
        dh: ClientDh,
        rows: fn(&SharedState) -> &Vec<Vec<StdMutex<Vec<u8>>>>,
    ) -> Result<Vec<u8>, MixError> {
        let st = self.shared()?.clone();
        let id = dh.id as usize;
        if id >= st.n_clients {
            return Err(MixError::ProtocolSequence(format!("bad client id {id}")));
        }
        let client_pub = point_from_bytes(&dh.public)?;

        let _guard = self.dh_lock.lock().await;
        let mut rng = StdRng::from_os_rng();
        let secret = random_scalar(&mut rng);
        let public = RISTRETTO_BASEPOINT_POINT * secret;
        let seed = point_bytes(&(client_pub * secret));

        let table = rows(&st);
        let mut prev = seed;
        for slot in table.iter() {
            let mut row = slot[id].lock().expect("chain row lock");
            prg_seed(&prev, &mut row);
            prev = row.clone();
        }
        Ok(point_bytes(&public))
    }

    // --- Accessors for the integration suite ---

    pub async fn keys(&self) -> Vec<Vec<u8>> {
        match self.shared.get() {
            Some(st) => st.keys.read().await.clone(),
            None => Vec::new(),
        }
    }

    pub fn masks(&self) -> Vec<Vec<Vec<u8>>> {
        self.chain_snapshot(|st| &st.masks)
    }

    pub fn secrets(&self) -> Vec<Vec<Vec<u8>>> {
        self.chain_snapshot(|st| &st.secrets)
    }

    fn chain_snapshot(
        &self,
        rows: fn(&SharedState) -> &Vec<Vec<StdMutex<Vec<u8>>>>,
    ) -> Vec<Vec<Vec<u8>>> {
        match self.shared.get() {
            Some(st) => rows(st)
                .iter()
                .map(|slot| {
                    slot.iter()
                        .map(|row| row.lock().expect("chain row lock").clone())
                        .collect()
                })
                .collect(),
            None => Vec::new(),
        }
    }

    pub async fn client_map(&self) -> HashMap<usize, usize> {
        self.client_map.read().await.clone()
    }

    pub fn round_slots(&self) -> usize {
        match self.shared.get() {
            Some(st) => st.rounds.len(),
            None => 0,
        }
    }
}

fn slot_of(round: u64) -> usize {
    (round % MAX_ROUNDS as u64) as usize
}

fn decode_cts(xs: &PointRow, ys: &PointRow, n: usize) -> Result<Vec<Ciphertext>, MixError> {
    if xs.points.len() != n || ys.points.len() != n {
        return Err(MixError::ProtocolSequence("short point row".into()));
    }
    xs.points
        .iter()
        .zip(ys.points.iter())
        .map(|(x, y)| {
            Ok(Ciphertext {
                a: point_from_bytes(x)?,
                b: point_from_bytes(y)?,
            })
        })
        .collect()
}

pub async fn spawn_server(cfg: ServerConfig) -> Result<Arc<MixServer>, MixError> {
    let addr: SocketAddr = cfg
        .servers
        .get(cfg.id)
        .ok_or_else(|| MixError::ProtocolSequence(format!("server id {} out of range", cfg.id)))?
        .parse()
        .map_err(|e| MixError::ProtocolSequence(format!("bad listen address: {e}")))?;
    let server = MixServer::new(cfg);

    let svc = MixServiceServer::new(MixGrpc(server.clone()));
    tokio::spawn(async move {
        if let Err(e) = tonic::transport::Server::builder()
            .add_service(svc)
            .serve(addr)
            .await
        {
            error!(error = %e, "rpc listener failed");
        }
    });

    let background = server.clone();
    tokio::spawn(async move {
        if let Err(e) = background.connect_servers().await {
            error!(server = background.cfg.id, error = %e, "cluster connect failed");
            return;
        }
        background.run_handlers().await;
    });
    Ok(server)
}

pub struct MixGrpc(pub Arc<MixServer>);

#[tonic::async_trait]
impl MixService for MixGrpc {
    async fn register(
        &self,
        request: tonic::Request<RegisterRequest>,
    ) -> Result<Response<RegisterReply>, Status> {
        let req = request.into_inner();
        let client_id = self.0.handle_register(req.server_id as usize).await?;
        Ok(Response::new(RegisterReply { client_id }))
    }

    async fn register2(
        &self,
        request: tonic::Request<ClientRegistration>,
    ) -> Result<Response<Empty>, Status> {
        self.0.handle_register2(request.into_inner()).await?;
        Ok(Response::new(Empty {}))
    }

    async fn register_done2(
        &self,
        request: tonic::Request<RegisterDoneRequest>,
    ) -> Result<Response<Empty>, Status> {
        let req = request.into_inner();
        self.0
            .handle_register_done2(req.num_clients as usize)
            .await?;
        Ok(Response::new(Empty {}))
    }

    async fn get_num_clients(
        &self,
        _request: tonic::Request<Empty>,
    ) -> Result<Response<NumClientsReply>, Status> {
        let server = &self.0;
        {
            let mut rx = server.reg_rx.lock().await;
            match server.with_deadline(rx.recv()).await? {
                Some(()) => {}
                None => return Err(MixError::closed().into()),
            }
        }
        Ok(Response::new(NumClientsReply {
            num_clients: server.cfg.total_clients as u32,
        }))
    }

    async fn get_pk(
        &self,
        _request: tonic::Request<Empty>,
    ) -> Result<Response<PointReply>, Status> {
        Ok(Response::new(PointReply {
            point: self.0.pk_bin.clone(),
        }))
    }

    async fn get_eph_key(
        &self,
        _request: tonic::Request<Empty>,
    ) -> Result<Response<PointReply>, Status> {
        let point = RISTRETTO_BASEPOINT_POINT * self.0.eph_secret;
        Ok(Response::new(PointReply {
            point: point_bytes(&point),
        }))
    }

    async fn share_mask(
        &self,
        request: tonic::Request<ClientDh>,
    ) -> Result<Response<PointReply>, Status> {
        let point = self
            .0
            .share_chain(request.into_inner(), |st| &st.masks)
            .await?;
        Ok(Response::new(PointReply { point }))
    }

    async fn share_secret(
        &self,
        request: tonic::Request<ClientDh>,
    ) -> Result<Response<PointReply>, Status> {
        let point = self
            .0
            .share_chain(request.into_inner(), |st| &st.secrets)
            .await?;
        Ok(Response::new(PointReply { point }))
    }

    async fn upload_keys(
        &self,
        request: tonic::Request<UpKey>,
    ) -> Result<Response<Empty>, Status> {
        let st = self.0.shared()?.clone();
        st.key_upload_tx
            .send(request.into_inner())
            .await
            .map_err(|_| MixError::closed())?;
        Ok(Response::new(Empty {}))
    }

    async fn put_aux_proof(
        &self,
        request: tonic::Request<AuxKeyProof>,
    ) -> Result<Response<Empty>, Status> {
        let aux = request.into_inner();
        let st = self.0.shared()?.clone();
        let sid = aux.sid as usize;
        if sid >= st.aux_tx.len() {
            return Err(MixError::ProtocolSequence(format!("bad server id {sid}")).into());
        }
        st.aux_tx[sid]
            .send(aux)
            .await
            .map_err(|_| MixError::closed())?;
        Ok(Response::new(Empty {}))
    }

    async fn share_server_keys(
        &self,
        request: tonic::Request<InternalKey>,
    ) -> Result<Response<CorrectReply>, Status> {
        let correct = self
            .0
            .handle_share_server_keys(request.into_inner())
            .await?;
        Ok(Response::new(CorrectReply { correct }))
    }

    async fn key_ready(
        &self,
        _request: tonic::Request<KeyReadyRequest>,
    ) -> Result<Response<Empty>, Status> {
        let st = self.0.shared()?.clone();
        match self.0.with_deadline(st.keys_rdy.acquire()).await? {
            Ok(permit) => permit.forget(),
            Err(_) => return Err(MixError::closed().into()),
        }
        Ok(Response::new(Empty {}))
    }

    async fn request_block(
        &self,
        request: tonic::Request<Request>,
    ) -> Result<Response<Empty>, Status> {
        let mut first = self.0.peer(0).map_err(Status::from)?;
        first.request_block2(request.into_inner()).await?;
        Ok(Response::new(Empty {}))
    }

    async fn request_block2(
        &self,
        request: tonic::Request<Request>,
    ) -> Result<Response<Empty>, Status> {
        let req = request.into_inner();
        let st = self.0.shared()?.clone();
        let id = req.id as usize;
        if id >= st.n_clients {
            return Err(MixError::ProtocolSequence(format!("bad client id {id}")).into());
        }
        let rs = &st.rounds[slot_of(req.round)];
        rs.req_tx[id]
            .send(req)
            .await
            .map_err(|_| MixError::closed())?;
        Ok(Response::new(Empty {}))
    }

    async fn share_server_requests(
        &self,
        request: tonic::Request<RequestList>,
    ) -> Result<Response<Empty>, Status> {
        let reqs = request.into_inner().requests;
        let round = reqs
            .first()
            .map(|r| r.round)
            .ok_or_else(|| MixError::ProtocolSequence("empty request batch".into()))?;
        let st = self.0.shared()?.clone();
        st.rounds[slot_of(round)]
            .requests_tx
            .send(reqs)
            .await
            .map_err(|_| MixError::closed())?;
        Ok(Response::new(Empty {}))
    }

    async fn put_plain_requests(
        &self,
        request: tonic::Request<RequestList>,
    ) -> Result<Response<Empty>, Status> {
        let reqs = request.into_inner().requests;
        let round = reqs
            .first()
            .map(|r| r.round)
            .ok_or_else(|| MixError::ProtocolSequence("empty request batch".into()))?;
        let server = &self.0;
        let st = server.shared()?.clone();
        let rs = &st.rounds[slot_of(round)];
        *rs.req_hashes.write().await = reqs.into_iter().map(|r| r.hash).collect();

        let cmap = server.client_map.read().await;
        for c in 0..st.n_clients {
            if cmap.get(&c) == Some(&server.cfg.id) {
                rs.req_hashes_rdy[c].add_permits(1);
            }
        }
        Ok(Response::new(Empty {}))
    }

    async fn get_req_hashes(
        &self,
        request: tonic::Request<RequestArg>,
    ) -> Result<Response<HashList>, Status> {
        let arg = request.into_inner();
        let server = &self.0;
        let st = server.shared()?.clone();
        let rs = &st.rounds[slot_of(arg.round)];
        let id = arg.id as usize;
        if id >= st.n_clients {
            return Err(MixError::ProtocolSequence(format!("bad client id {id}")).into());
        }
        match server.with_deadline(rs.req_hashes_rdy[id].acquire()).await? {
            Ok(permit) => permit.forget(),
            Err(_) => return Err(MixError::closed().into()),
        }
        let resp = Ok(Response::new(HashList {
            hashes: rs.req_hashes.read().await.clone(),
        }));
        resp
    }

    async fn upload_block(
        &self,
        request: tonic::Request<Block>,
    ) -> Result<Response<Empty>, Status> {
        let mut first = self.0.peer(0).map_err(Status::from)?;
        first.upload_block2(request.into_inner()).await?;
        Ok(Response::new(Empty {}))
    }

    async fn upload_block2(
        &self,
        request: tonic::Request<Block>,
    ) -> Result<Response<Empty>, Status> {
        let block = request.into_inner();
        let st = self.0.shared()?.clone();
        let id = block.id as usize;
        if id >= st.n_clients {
            return Err(MixError::ProtocolSequence(format!("bad client id {id}")).into());
        }
        let rs = &st.rounds[slot_of(block.round)];
        rs.ublock_tx[id]
            .send(block)
            .await
            .map_err(|_| MixError::closed())?;
        Ok(Response::new(Empty {}))
    }

    async fn share_server_blocks(
        &self,
        request: tonic::Request<BlockList>,
    ) -> Result<Response<Empty>, Status> {
        let blocks = request.into_inner().blocks;
        let round = blocks
            .first()
            .map(|b| b.round)
            .ok_or_else(|| MixError::ProtocolSequence("empty block batch".into()))?;
        let st = self.0.shared()?.clone();
        st.rounds[slot_of(round)]
            .shuffle_tx
            .send(blocks)
            .await
            .map_err(|_| MixError::closed())?;
        Ok(Response::new(Empty {}))
    }

    async fn put_plain_blocks(
        &self,
        request: tonic::Request<BlockList>,
    ) -> Result<Response<Empty>, Status> {
        let blocks = request.into_inner().blocks;
        let round = blocks
            .first()
            .map(|b| b.round)
            .ok_or_else(|| MixError::ProtocolSequence("empty block batch".into()))?;
        let server = &self.0;
        let st = server.shared()?.clone();
        let rs = &st.rounds[slot_of(round)];

        *rs.up_hashes.write().await = blocks.iter().map(|b| hash_block(&b.block)).collect();

        {
            let cmap = server.client_map.read().await;
            for c in 0..st.n_clients {
                if cmap.get(&c) == Some(&server.cfg.id) {
                    rs.up_hashes_rdy[c].add_permits(1);
                }
            }
        }

        rs.dblocks_tx
            .send(blocks)
            .await
            .map_err(|_| MixError::closed())?;
        Ok(Response::new(Empty {}))
    }

    async fn get_up_hashes(
        &self,
        request: tonic::Request<RequestArg>,
    ) -> Result<Response<HashList>, Status> {
        let arg = request.into_inner();
        let server = &self.0;
        let st = server.shared()?.clone();
        let rs = &st.rounds[slot_of(arg.round)];
        let id = arg.id as usize;
        if id >= st.n_clients {
            return Err(MixError::ProtocolSequence(format!("bad client id {id}")).into());
        }
        match server.with_deadline(rs.up_hashes_rdy[id].acquire()).await? {
            Ok(permit) => permit.forget(),
            Err(_) => return Err(MixError::closed().into()),
        }
        let resp = Ok(Response::new(HashList {
            hashes: rs.up_hashes.read().await.clone(),
        }));
        resp
    }

    async fn get_response(
        &self,
        request: tonic::Request<ClientMask>,
    ) -> Result<Response<ResponseReply>, Status> {
        let block = self.0.handle_get_response(request.into_inner()).await?;
        Ok(Response::new(ResponseReply { block }))
    }

    async fn put_client_block(
        &self,
        request: tonic::Request<ClientBlock>,
    ) -> Result<Response<Empty>, Status> {
        let cb = request.into_inner();
        let block = cb
            .block
            .ok_or_else(|| MixError::ProtocolSequence("missing block".into()))?;
        let st = self.0.shared()?.clone();
        let sid = cb.sid as usize;
        let cid = cb.cid as usize;
        if sid >= self.0.n_servers() || cid >= st.n_clients {
            return Err(
                MixError::ProtocolSequence(format!("bad routing envelope {sid}/{cid}")).into(),
            );
        }
        st.rounds[slot_of(block.round)].xors_tx[sid][cid]
            .send(block)
            .await
            .map_err(|_| MixError::closed())?;
        Ok(Response::new(Empty {}))
    }
}
