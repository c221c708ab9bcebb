use animica_p2p::crypto::aead::AeadAlgorithm;
use animica_p2p::crypto::handshake::{initiator_begin, initiator_complete, responder_respond};
use animica_p2p::peer::{Peer, PeerStore, ScoreParams};
use animica_p2p::Result;

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    println!("🚀 Animica P2P core - handshake + peer store walkthrough");
    println!("=========================================================");

    println!("\n1. Running the two-flight handshake...");
    let hello_i = b"hello-i-demo".to_vec();
    let hello_r = b"hello-r-demo".to_vec();
    let (init_state, pk_i) = initiator_begin(hello_i.clone(), AeadAlgorithm::ChaCha20Poly1305);
    let (ct, responder_keys) = responder_respond(&hello_i, &pk_i, &hello_r, AeadAlgorithm::ChaCha20Poly1305)?;
    let initiator_keys = initiator_complete(init_state, &hello_r, &ct)?;
    println!(
        "✅ transcripts match: {}",
        initiator_keys.transcript_hash == responder_keys.transcript_hash
    );

    println!("\n2. Exchanging an encrypted ping over the derived keys...");
    let mut init_send = initiator_keys.send_context()?;
    let resp_recv = responder_keys.recv_context()?;
    let (ciphertext, seq) = init_send.encrypt(b"ping", None)?;
    let plaintext = resp_recv.decrypt(&ciphertext, seq, None)?;
    println!("✅ responder decrypted: {}", String::from_utf8_lossy(&plaintext));

    println!("\n3. Recording the new peer in an in-memory store...");
    let store = PeerStore::in_memory()?;
    let params = ScoreParams::default();
    let now = 0.0;
    let mut peer = Peer::new("demo-peer".to_string(), "tcp/127.0.0.1:30333".to_string(), 1, now);
    peer.on_connected(now, &params);
    store.upsert(&mut peer, now, &params)?;
    let fetched = store.get("demo-peer")?.expect("peer was just inserted");
    println!("✅ stored peer status: {:?}", fetched.status);

    Ok(())
}
