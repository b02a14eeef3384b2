//! End-to-end purchase against a simulated seller over an in-memory channel.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use jsonwebtoken::{encode, EncodingKey, Header};

use oblivious_purchase::core::CircuitHasher;
use oblivious_purchase::crypto::{CryptoProvider, SeededCrypto};
use oblivious_purchase::market::OrderId;
use oblivious_purchase::network::protocol::{
    Deliver, OtStart, RoundChallengePayload, RoundStart, SignedUrl,
};
use oblivious_purchase::network::{
    run_session, ClientMessage, FailureReason, MemoryChannel, MemoryPeer, Outbound,
    PurchaseSession, ServerMessage, SessionConfig, SessionContext, SessionPhase, CLOSE_NORMAL,
};
use oblivious_purchase::ot::MASTER_KEY_LEN;
use oblivious_purchase::proof::{
    CatalogLeaf, ProofBundle, ProofCoordinator, ProofError, ProvingEngine, PurchaseSecret, Witness,
};
use oblivious_purchase::retrieval::{Downloader, RetrievalError};
use oblivious_purchase::store::{MemorySecretStore, SecretStore};

const ORDER: &str = "order-42";
const STALL: &str = "mem://stall";

// =============================================================================
// FIXTURES
// =============================================================================

/// Echoes the witness's public inputs instead of running a circuit.
struct EchoProver;

impl ProvingEngine for EchoProver {
    fn full_prove(&self, witness: &Witness) -> Result<ProofBundle, ProofError> {
        Ok(ProofBundle {
            proof: serde_json::json!({ "protocol": "groth16" }),
            public_signals: witness.public_inputs().to_vec(),
        })
    }
}

/// Takes `delay` before answering like [`EchoProver`].
struct SlowProver {
    delay: Duration,
}

impl ProvingEngine for SlowProver {
    fn full_prove(&self, witness: &Witness) -> Result<ProofBundle, ProofError> {
        std::thread::sleep(self.delay);
        EchoProver.full_prove(witness)
    }
}

/// Seller-side content: one content key and sealed asset per item.
struct Market {
    content_keys: Vec<Vec<u8>>,
    plaintexts: Vec<Vec<u8>>,
    assets: HashMap<String, Vec<u8>>,
}

impl Market {
    fn new(items: usize, crypto: &mut SeededCrypto) -> Self {
        let mut content_keys = Vec::new();
        let mut plaintexts = Vec::new();
        let mut assets = HashMap::new();
        for i in 0..items {
            let mut key = vec![0u8; 32];
            crypto.fill_bytes(&mut key);
            let plaintext = format!("contents of item {}", i + 1).into_bytes();
            assets.insert(locator(i), crypto.seal(&key, &plaintext).unwrap());
            content_keys.push(key);
            plaintexts.push(plaintext);
        }
        Self { content_keys, plaintexts, assets }
    }
}

fn locator(index: usize) -> String {
    format!("mem://asset/{}", index)
}

impl Downloader for Market {
    fn fetch<'a>(&'a self, locator: &'a str) -> BoxFuture<'a, Result<Vec<u8>, RetrievalError>> {
        Box::pin(async move {
            if locator == STALL {
                return futures_util::future::pending().await;
            }
            self.assets
                .get(locator)
                .cloned()
                .ok_or_else(|| RetrievalError::Download(format!("HTTP 404 for {}", locator)))
        })
    }
}

fn catalog() -> Vec<CatalogLeaf> {
    vec![
        CatalogLeaf::new("1", 1_000),
        CatalogLeaf::new("2", 1_500),
        CatalogLeaf::new("3", 2_000),
        CatalogLeaf::new("4", 2_500),
    ]
}

fn credential() -> String {
    encode(
        &Header::default(),
        &serde_json::json!({ "sub": "buyer", "exp": 4_000_000_000u64 }),
        &EncodingKey::from_secret(b"seller-side"),
    )
    .unwrap()
}

struct Buyer {
    session: PurchaseSession,
    channel: MemoryChannel,
    store: Arc<MemorySecretStore>,
    commitment: String,
}

/// Buyer who has checked out item "3" (leaf 2), with a depth-2 tree.
fn buyer(market: Arc<Market>, timeout: Duration) -> (Buyer, MemoryPeer) {
    buyer_with_prover(market, timeout, Arc::new(EchoProver))
}

fn buyer_with_prover(
    market: Arc<Market>,
    timeout: Duration,
    prover: Arc<dyn ProvingEngine>,
) -> (Buyer, MemoryPeer) {
    let order = OrderId::parse(ORDER).unwrap();
    let mut hasher = CircuitHasher::new().unwrap();
    let mut crypto = SeededCrypto::new(7);
    let secret = PurchaseSecret::generate(&mut hasher, &mut crypto, "3", 2_000).unwrap();
    let commitment = secret.commitment.to_decimal();

    let store = Arc::new(MemorySecretStore::new());
    store.save(&order, &secret).unwrap();

    let ctx = SessionContext {
        catalog: catalog(),
        prover: ProofCoordinator::new(prover),
        downloader: market,
        secrets: store.clone(),
        crypto: Box::new(SeededCrypto::new(8)),
    };
    let config = SessionConfig { tree_levels: 2, timeout };
    let session = PurchaseSession::new(order.clone(), credential(), config, ctx).unwrap();
    let (channel, peer) = MemoryChannel::pair(order);

    (Buyer { session, channel, store, commitment }, peer)
}

// =============================================================================
// SIMULATED SELLER
// =============================================================================

struct Seller {
    peer: MemoryPeer,
    crypto: SeededCrypto,
    seeds: Vec<[Vec<u8>; 2]>,
}

impl Seller {
    fn new(peer: MemoryPeer) -> Self {
        Self { peer, crypto: SeededCrypto::new(99), seeds: Vec::new() }
    }

    async fn send(&self, message: ServerMessage) {
        self.peer.send(message).await.unwrap();
    }

    async fn expect(&mut self) -> ClientMessage {
        match self.peer.recv().await {
            Some(Outbound::Message(message)) => message,
            other => panic!("seller expected a message, got {other:?}"),
        }
    }

    /// Drain until the buyer's close frame.
    async fn close_frame(&mut self) -> (u16, String) {
        loop {
            match self.peer.recv().await {
                Some(Outbound::Close { code, reason }) => return (code, reason),
                Some(Outbound::Message(_)) => continue,
                None => panic!("channel dropped without a close frame"),
            }
        }
    }

    async fn handshake(&mut self) -> ProofBundle {
        assert!(matches!(self.expect().await, ClientMessage::Init { .. }));
        self.send(ServerMessage::ZkpReady).await;
        match self.expect().await {
            ClientMessage::ZkpProve { payload } => payload,
            other => panic!("expected ZKP_PROVE, got {other:?}"),
        }
    }

    async fn start_ot(&mut self, num_books: usize) {
        self.send(ServerMessage::OtStart { payload: OtStart { num_books } }).await;
        assert_eq!(self.expect().await, ClientMessage::OtAckStart);
    }

    /// One round; `corrupt` flips a tag byte of that branch's sealed seed.
    async fn run_round(&mut self, round: usize, corrupt: Option<usize>) {
        self.send(ServerMessage::OtRoundStart { payload: RoundStart { round } }).await;
        let client_key = match self.expect().await {
            ClientMessage::OtRoundResponse { payload } => {
                assert_eq!(payload.round, round);
                hex::decode(payload.client_public_key).unwrap()
            }
            other => panic!("expected OT_ROUND_RESPONSE, got {other:?}"),
        };

        let mut publics = Vec::new();
        let mut sealed = Vec::new();
        let mut seeds = Vec::new();
        for branch in 0..2 {
            let pair = self.crypto.generate_keypair();
            let key = pair.derive_round_key(&client_key).unwrap();
            let mut seed = vec![0u8; MASTER_KEY_LEN];
            self.crypto.fill_bytes(&mut seed);
            let mut ct = self.crypto.seal(key.as_ref(), &seed).unwrap();
            if corrupt == Some(branch) {
                let last = ct.len() - 1;
                ct[last] ^= 0x01;
            }
            publics.push(pair.public_key_hex());
            sealed.push(hex::encode(ct));
            seeds.push(seed);
        }
        self.seeds.push([seeds[0].clone(), seeds[1].clone()]);

        self.send(ServerMessage::OtRoundChallenge {
            payload: RoundChallengePayload {
                round,
                g0: publics[0].clone(),
                g1: publics[1].clone(),
                e0: sealed[0].clone(),
                e1: sealed[1].clone(),
            },
        })
        .await;
    }

    fn master_key_for(&self, index: usize) -> Vec<u8> {
        let mut master = vec![0u8; MASTER_KEY_LEN];
        for (round, pair) in self.seeds.iter().enumerate() {
            let seed = &pair[(index >> round) & 1];
            master.iter_mut().zip(seed).for_each(|(m, s)| *m ^= s);
        }
        master
    }

    async fn deliver(&mut self, market: &Market) {
        assert_eq!(self.expect().await, ClientMessage::OtRoundsComplete);
        let bundle = (0..market.content_keys.len())
            .map(|i| {
                let master = self.master_key_for(i);
                hex::encode(self.crypto.seal(&master, &market.content_keys[i]).unwrap())
            })
            .collect();
        self.send(ServerMessage::OtDeliver { payload: Deliver { encrypted_secrets: bundle } })
            .await;
    }

    async fn serve_locator(&mut self, locator_for: impl Fn(usize) -> String) -> usize {
        let index = match self.expect().await {
            ClientMessage::RequestSignedUrl { payload } => payload.book_index,
            other => panic!("expected REQUEST_SIGNED_URL, got {other:?}"),
        };
        let payload = SignedUrl { signed_url: locator_for(index) };
        self.send(ServerMessage::SignedUrl { payload }).await;
        index
    }
}

fn market() -> Arc<Market> {
    Arc::new(Market::new(4, &mut SeededCrypto::new(3)))
}

// =============================================================================
// SCENARIOS
// =============================================================================

#[tokio::test]
async fn test_full_purchase() {
    let market = market();
    let (mut buyer, peer) = buyer(market.clone(), Duration::from_secs(10));
    let mut seller = Seller::new(peer);
    let commitment = buyer.commitment.clone();

    let seller_side = async {
        let proof = seller.handshake().await;
        assert!(proof.public_signals.contains(&commitment));
        assert!(proof.public_signals.contains(&"2000".to_string()));

        seller.start_ot(4).await;
        for round in 0..2 {
            seller.run_round(round, None).await;
        }
        seller.deliver(&market).await;
        let index = seller.serve_locator(locator).await;
        assert_eq!(seller.expect().await, ClientMessage::DownloadReady);
        (index, seller.close_frame().await)
    };

    let (result, (index, close)) =
        tokio::join!(run_session(&mut buyer.session, &mut buyer.channel), seller_side);

    let asset = result.unwrap();
    assert_eq!(index, 2);
    assert_eq!(asset.as_bytes(), market.plaintexts[2].as_slice());
    assert_eq!(close.0, CLOSE_NORMAL);
    assert_eq!(buyer.session.phase(), SessionPhase::Done);
    assert!(!buyer.store.contains(&OrderId::parse(ORDER).unwrap()));
}

#[tokio::test]
async fn test_tampered_unchosen_branch_is_ignored() {
    let market = market();
    let (mut buyer, peer) = buyer(market.clone(), Duration::from_secs(10));
    let mut seller = Seller::new(peer);

    // Leaf 2 chooses branch 0 in round 0 and branch 1 in round 1.
    let seller_side = async {
        seller.handshake().await;
        seller.start_ot(4).await;
        seller.run_round(0, Some(1)).await;
        seller.run_round(1, Some(0)).await;
        seller.deliver(&market).await;
        seller.serve_locator(locator).await;
        assert_eq!(seller.expect().await, ClientMessage::DownloadReady);
        seller.close_frame().await
    };

    let (result, close) =
        tokio::join!(run_session(&mut buyer.session, &mut buyer.channel), seller_side);

    assert_eq!(result.unwrap().as_bytes(), market.plaintexts[2].as_slice());
    assert_eq!(close.0, CLOSE_NORMAL);
}

#[tokio::test]
async fn test_corrupted_seed_fails_with_aead() {
    let market = market();
    let (mut buyer, peer) = buyer(market, Duration::from_secs(10));
    let mut seller = Seller::new(peer);

    let seller_side = async {
        seller.handshake().await;
        seller.start_ot(4).await;
        seller.run_round(0, Some(0)).await;
        seller.close_frame().await
    };

    let (result, close) =
        tokio::join!(run_session(&mut buyer.session, &mut buyer.channel), seller_side);

    let failure = result.unwrap_err();
    assert_eq!(failure.reason, FailureReason::AeadFailure);
    assert_eq!(close.0, 4005);
    assert!(matches!(failure.phase, SessionPhase::OtRound { round: 0, .. }));
    assert!(buyer.store.contains(&OrderId::parse(ORDER).unwrap()));
}

#[tokio::test]
async fn test_catalog_size_mismatch_closes_channel() {
    let (mut buyer, peer) = buyer(market(), Duration::from_secs(10));
    let mut seller = Seller::new(peer);

    let seller_side = async {
        seller.handshake().await;
        seller.send(ServerMessage::OtStart { payload: OtStart { num_books: 8 } }).await;
        seller.close_frame().await
    };

    let (result, close) =
        tokio::join!(run_session(&mut buyer.session, &mut buyer.channel), seller_side);

    assert_eq!(result.unwrap_err().reason, FailureReason::CatalogSizeMismatch);
    assert_eq!(close.0, 4011);
}

#[tokio::test]
async fn test_out_of_order_message() {
    let (mut buyer, peer) = buyer(market(), Duration::from_secs(10));
    let mut seller = Seller::new(peer);

    let seller_side = async {
        assert!(matches!(seller.expect().await, ClientMessage::Init { .. }));
        seller.send(ServerMessage::OtStart { payload: OtStart { num_books: 4 } }).await;
        seller.close_frame().await
    };

    let (result, close) =
        tokio::join!(run_session(&mut buyer.session, &mut buyer.channel), seller_side);

    let failure = result.unwrap_err();
    assert_eq!(failure.reason, FailureReason::UnexpectedMessage);
    assert_eq!(failure.phase, SessionPhase::AwaitingProofTrigger);
    assert_eq!(close.0, 4007);
}

#[tokio::test]
async fn test_malformed_frame() {
    let (mut buyer, peer) = buyer(market(), Duration::from_secs(10));
    let mut seller = Seller::new(peer);

    let seller_side = async {
        assert!(matches!(seller.expect().await, ClientMessage::Init { .. }));
        seller.peer.send_text("{\"type\":\"ZKP_READY\"").await.unwrap();
        seller.close_frame().await
    };

    let (result, close) =
        tokio::join!(run_session(&mut buyer.session, &mut buyer.channel), seller_side);

    assert_eq!(result.unwrap_err().reason, FailureReason::MalformedMessage);
    assert_eq!(close.0, 4012);
}

#[tokio::test]
async fn test_silent_seller_times_out() {
    let (mut buyer, peer) = buyer(market(), Duration::from_millis(200));
    let mut seller = Seller::new(peer);

    let seller_side = async {
        assert!(matches!(seller.expect().await, ClientMessage::Init { .. }));
        seller.close_frame().await
    };

    let (result, close) =
        tokio::join!(run_session(&mut buyer.session, &mut buyer.channel), seller_side);

    assert_eq!(result.unwrap_err().reason, FailureReason::Timeout);
    assert_eq!(close.0, 4010);
}

#[tokio::test]
async fn test_seller_hangs_up_during_download() {
    let market = market();
    let (mut buyer, peer) = buyer(market.clone(), Duration::from_secs(10));
    let mut seller = Seller::new(peer);

    let seller_side = async {
        seller.handshake().await;
        seller.start_ot(4).await;
        for round in 0..2 {
            seller.run_round(round, None).await;
        }
        seller.deliver(&market).await;
        seller.serve_locator(|_| STALL.to_string()).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        seller.peer.close();
        seller.close_frame().await
    };

    let (result, close) =
        tokio::join!(run_session(&mut buyer.session, &mut buyer.channel), seller_side);

    let failure = result.unwrap_err();
    assert_eq!(failure.reason, FailureReason::ChannelClosed);
    assert_eq!(failure.phase, SessionPhase::Decrypting);
    assert_eq!(close.0, 4014);
}

#[tokio::test]
async fn test_seller_hangs_up_during_proving() {
    let prover = Arc::new(SlowProver { delay: Duration::from_secs(2) });
    let (mut buyer, peer) = buyer_with_prover(market(), Duration::from_secs(10), prover);
    let mut seller = Seller::new(peer);
    let started = tokio::time::Instant::now();

    let seller_side = async {
        assert!(matches!(seller.expect().await, ClientMessage::Init { .. }));
        seller.send(ServerMessage::ZkpReady).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        seller.peer.close();
        seller.close_frame().await
    };

    let (result, close) =
        tokio::join!(run_session(&mut buyer.session, &mut buyer.channel), seller_side);

    let failure = result.unwrap_err();
    assert_eq!(failure.reason, FailureReason::ChannelClosed);
    assert_eq!(failure.phase, SessionPhase::AwaitingProofTrigger);
    assert_eq!(close.0, 4014);
    assert!(started.elapsed() < Duration::from_secs(1));
}

#[tokio::test]
async fn test_wrong_asset_fails_content_decrypt() {
    let market = market();
    let (mut buyer, peer) = buyer(market.clone(), Duration::from_secs(10));
    let mut seller = Seller::new(peer);

    let seller_side = async {
        seller.handshake().await;
        seller.start_ot(4).await;
        for round in 0..2 {
            seller.run_round(round, None).await;
        }
        seller.deliver(&market).await;
        seller.serve_locator(|_| locator(0)).await;
        seller.close_frame().await
    };

    let (result, close) =
        tokio::join!(run_session(&mut buyer.session, &mut buyer.channel), seller_side);

    assert_eq!(result.unwrap_err().reason, FailureReason::ContentDecrypt);
    assert_eq!(close.0, 4009);
}
