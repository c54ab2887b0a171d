//! mega-crypto: client-side crypto core for the MEGA storage protocol
//!
//! Architecture: AES-128-CTR keystream with an interleaved chunked CBC-MAC
//!
//! Pipeline: source → 16-byte blocks → CTR keystream XOR → chunk MAC fold → MetaMac
//!
//! Key hierarchy:
//! ```text
//! Password ──(65536×AES or PBKDF2-SHA512)──► Password Key (128-bit)
//!   └── Master Key (128-bit, wrapped by password key)
//!       ├── Share Key (per shared folder, wrapped by master key)
//!       │   └── Node keys inside the share (wrapped by share key)
//!       ├── Folder Key (128-bit random, wrapped by master or share key)
//!       └── File Key (256-bit on the wire, wrapped by master or share key)
//!           ├── AES key  = k[0..16] ^ k[16..32]
//!           ├── IV       = k[16..24]
//!           └── MetaMac  = k[24..32]
//! ```

pub mod attributes;
pub mod block;
pub mod chunks;
pub mod encoding;
pub mod error;
pub mod kdf;
pub mod keys;
pub mod links;
pub mod nodes;
pub mod session;
pub mod stream;
pub mod upload;

pub use attributes::{decrypt_attributes, encrypt_attributes, Attributes, Fingerprint};
pub use chunks::chunk_positions;
pub use error::{CryptoError, CryptoResult};
pub use kdf::{decrypt_master_key, derive_login_keys, AuthInfo, LoginKeys, MasterKey};
pub use keys::{unwrap_key, wrap_key, FileKey, FolderKey, NodeKey, ShareKey};
pub use links::{LinkKind, PublicLink};
pub use nodes::{resolve_nodes, NewFileNode, NewFolderNode, Node, NodeListing};
pub use session::Session;
pub use stream::{copy_stream, copy_stream_with_config, AesCtrStream, StreamMode};
pub use upload::{
    drive_upload, fragment_url, upload_chunk_sizes, PackSize, UploadFragment, UploadPlan,
};

/// AES-128 key size in bytes
pub const KEY_SIZE: usize = 16;

/// AES block size; every CTR step and MAC step works on one block
pub const BLOCK_SIZE: usize = 16;

/// Size of the CTR nonce half (the other half is the block counter)
pub const IV_SIZE: usize = 8;

/// Size of the condensed file MAC stored in the node key
pub const META_MAC_SIZE: usize = 8;

/// Size of a file node key on the wire
pub const FILE_KEY_SIZE: usize = 32;
