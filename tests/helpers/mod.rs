#![allow(dead_code)]

pub mod mock_peer;

use spindle::response::PushedResponse;
use spindle::session::{CloseOutcome, Session, SessionHandle};
use spindle::settings::SettingsStore;
use spindle::{Origin, SessionConfig};
use tokio::sync::mpsc;

use mock_peer::MockPeer;

/// A session wired to a scripted peer over an in-memory duplex pipe.
pub struct TestSession {
    pub task: tokio::task::JoinHandle<CloseOutcome>,
    pub handle: SessionHandle,
    pub pushes: mpsc::UnboundedReceiver<PushedResponse>,
    pub peer: MockPeer,
    pub store: SettingsStore,
    pub origin: Origin,
}

pub async fn start(config: SessionConfig) -> TestSession {
    let (client_io, peer_io) = tokio::io::duplex(1 << 20);
    let origin = Origin::new("https", "example.com", 443);
    let store = SettingsStore::new();
    let (session, handle, pushes) = Session::new(client_io, origin.clone(), config, store.clone());
    let task = tokio::spawn(session.run());
    TestSession {
        task,
        handle,
        pushes,
        peer: MockPeer::new(peer_io),
        store,
        origin,
    }
}
