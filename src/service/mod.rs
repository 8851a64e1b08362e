pub mod auth;
pub mod client;
pub mod connection;
pub mod descriptions;
pub mod registry;
pub mod token_store;
pub mod whip;

pub use auth::{Authenticator, Credential};
pub use client::{
    Client, ClientEvent, JoinKind, PresenceEvent, PresenceKind, Recorder, SignalingClient,
};
pub use connection::{
    CancelHandle, ConnectionState, DownConnection, Engine, IceCandidate, IceConnectionState,
    PeerConnection, SdpType, SessionDescription, TrackInfo, UpConnection, UpTrack,
};
pub use descriptions::DescriptionStore;
pub use registry::{Group, Groups};
pub use token_store::TokenStore;
pub use whip::{SdpFragment, WhipClient};
