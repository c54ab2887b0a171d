//! End-to-end flows through the crypto core: login, upload in fragments,
//! node creation, listing resolution and verified download.

use std::io::{self, Cursor, Write};

use mega_core::config::load_config;
use mega_core::{NodeHandle, UserHandle};
use mega_crypto::encoding::base64url_encode;
use mega_crypto::keys::wrap_key;
use mega_crypto::{
    copy_stream, copy_stream_with_config, decrypt_master_key, derive_login_keys, drive_upload,
    resolve_nodes, AesCtrStream, Attributes, AuthInfo, CryptoError, Fingerprint, NewFileNode,
    NewFolderNode, NodeListing, PackSize, PublicLink, Session, UploadPlan,
};
use secrecy::SecretString;
use serde_json::json;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

const ME: &str = "aBcDeFgHiJk";

fn make_data(size: usize) -> Vec<u8> {
    (0..size)
        .map(|i| (i.wrapping_mul(13) ^ (i >> 7)) as u8)
        .collect()
}

/// Log in against a simulated account whose master key is wrapped with
/// the v2 password key.
fn login(master: [u8; 16]) -> Session {
    let password = SecretString::from("s3cret passphrase");
    let auth = AuthInfo::v2(base64url_encode(&[0x5Cu8; 32]));
    let keys = derive_login_keys("Someone@Example.com", &password, &auth).unwrap();

    let wrapped_master = base64url_encode(&wrap_key(&keys.password_key, &master).unwrap());
    let master_key = decrypt_master_key(&wrapped_master, &keys.password_key).unwrap();
    assert_eq!(master_key.as_bytes(), &master);

    Session::new(UserHandle::from(ME), master_key, SecretString::from("session-id"))
}

/// Upload `data` fragment by fragment, returning the ciphertext the
/// "server" received and the node-creation material.
fn upload(data: &[u8], name: &str, pack: PackSize, wrapping: &[u8; 16]) -> (Vec<u8>, NewFileNode) {
    let length = data.len() as u64;
    let fingerprint = Fingerprint::compute(&mut Cursor::new(data), length, 1_700_000_000).unwrap();
    let plan = UploadPlan::new(length, pack);
    let mut stream = AesCtrStream::encrypter(Cursor::new(data.to_vec()), length);

    let mut received = Vec::new();
    let completion = drive_upload(&mut stream, &plan, &CancellationToken::new(), |fragment, bytes| {
        assert_eq!(fragment.offset, received.len() as u64, "fragments arrive in order");
        received.extend_from_slice(bytes);
        Ok((received.len() as u64 == length).then(|| "upload-token".to_string()))
    })
    .unwrap();
    assert_eq!(completion.as_deref(), Some("upload-token"));

    let attributes = Attributes::new(name).with_fingerprint(fingerprint);
    let node = NewFileNode::from_finished_upload(&stream, &attributes, wrapping).unwrap();
    (received, node)
}

#[test]
fn upload_list_download_roundtrip() {
    let master = [0x42u8; 16];
    let session = login(master);
    let folder = NewFolderNode::generate("Backups", &master).unwrap();

    let data = make_data(3 * 1024 * 1024 + 77);
    let (ciphertext, file) = upload(&data, "disk.img", PackSize::default(), &master);
    assert_ne!(&ciphertext[..64], &data[..64]);

    let listing: NodeListing = serde_json::from_value(json!({
        "f": [
            { "h": "rootHndl", "t": 2, "u": ME },
            { "h": "foldHndl", "p": "rootHndl", "t": 1, "u": ME,
              "k": format!("{ME}:{}", folder.wrapped_key), "a": folder.attributes },
            { "h": "fileHndl", "p": "foldHndl", "t": 0, "u": ME, "s": data.len(),
              "k": format!("{ME}:{}", file.wrapped_key), "a": file.attributes },
        ]
    }))
    .unwrap();

    let nodes = resolve_nodes(&session, &listing);
    let folder_node = nodes.iter().find(|n| n.handle.as_str() == "foldHndl").unwrap();
    assert_eq!(folder_node.name(), Some("Backups"));

    let file_node = nodes.iter().find(|n| n.handle.as_str() == "fileHndl").unwrap();
    assert_eq!(file_node.name(), Some("disk.img"));
    assert_eq!(
        file_node.fingerprint().map(|fp| fp.modified),
        Some(1_700_000_000)
    );

    let mut download = file_node.decrypter(Cursor::new(ciphertext)).unwrap();
    let mut plaintext = Vec::new();
    copy_stream(&mut download, &mut plaintext, 1000).unwrap();
    assert_eq!(plaintext, data);
    assert!(download.is_finished());
}

#[test]
fn tampered_ciphertext_fails_integrity_check() {
    let master = [0x42u8; 16];
    let data = make_data(200_000);
    let (mut ciphertext, file) = upload(&data, "a.bin", PackSize::All, &master);
    ciphertext[150_000] ^= 0x80;

    let mut download = AesCtrStream::for_file_key(Cursor::new(ciphertext), 200_000, &file.key);
    let err = copy_stream(&mut download, &mut std::io::sink(), 65536).unwrap_err();
    let err = CryptoError::from(err);
    assert!(matches!(err, CryptoError::DownloadCorrupted { .. }));
    assert!(err.is_retryable());
}

#[test]
fn pack_size_from_config_file_drives_fragmenting() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("mega.toml");
    std::fs::write(&path, "[transfer]\nchunks_pack_size = -1\n").unwrap();
    let config = load_config(&path).unwrap();

    let pack = PackSize::from(&config.transfer);
    let plan = UploadPlan::new(5 * 1024 * 1024, pack);
    assert_eq!(plan.len(), 1);

    let default_plan = UploadPlan::new(5 * 1024 * 1024, PackSize::default());
    assert!(default_plan.len() > 1);
}

/// Records the size of every write it receives.
#[derive(Default)]
struct WriteLog {
    sizes: Vec<usize>,
    data: Vec<u8>,
}

impl Write for WriteLog {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.sizes.push(buf.len());
        self.data.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[test]
fn buffer_size_from_config_file_drives_stream_reads() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("mega.toml");
    std::fs::write(&path, "[transfer]\nbuffer_size = 48\n").unwrap();
    let config = load_config(&path).unwrap();

    let data = make_data(200);
    let mut enc = AesCtrStream::encrypter(Cursor::new(data.clone()), 200);
    let mut ciphertext = WriteLog::default();
    let copied = copy_stream_with_config(&mut enc, &mut ciphertext, &config.transfer).unwrap();
    assert_eq!(copied, 200);
    assert_eq!(ciphertext.sizes, vec![48, 48, 48, 48, 8]);

    let node_key = enc.node_key().unwrap();
    let mut dec = AesCtrStream::for_file_key(Cursor::new(ciphertext.data), 200, &node_key);
    let mut plaintext = WriteLog::default();
    copy_stream_with_config(&mut dec, &mut plaintext, &config.transfer).unwrap();
    assert_eq!(plaintext.data, data);
}

#[test]
fn cancelled_upload_restarts_from_scratch() {
    let data = make_data(2 * 1024 * 1024);
    let length = data.len() as u64;
    let plan = UploadPlan::new(length, PackSize::Bytes(256 * 1024));
    let cancel = CancellationToken::new();

    let mut first = AesCtrStream::encrypter(Cursor::new(data.clone()), length);
    let result = drive_upload(&mut first, &plan, &cancel, |_, _| {
        cancel.cancel();
        Ok(None)
    });
    assert!(matches!(result, Err(CryptoError::Cancelled)));

    // A retry uses a fresh stream and the same plan
    let mut retry = AesCtrStream::encrypter(Cursor::new(data), length);
    let mut sent = 0u64;
    drive_upload(&mut retry, &plan, &CancellationToken::new(), |fragment, bytes| {
        sent += bytes.len() as u64;
        Ok((fragment.offset + fragment.length == length).then(|| "done".to_string()))
    })
    .unwrap();
    assert_eq!(sent, length);
    assert!(retry.node_key().is_some());
}

#[test]
fn public_folder_link_flow() {
    let master = [0x42u8; 16];
    let session = login(master);

    // The owner shares a folder: its share key becomes the link key.
    let share_key = [0x99u8; 16];
    let folder = NewFolderNode::generate("Public", &share_key).unwrap();
    let data = make_data(4096);
    let (ciphertext, file) = upload(&data, "notes.txt", PackSize::default(), &share_key);

    let listing = json!({
        "f": [
            { "h": "pubRoot1", "t": 1, "u": ME,
              "k": format!("pubRoot1:{}", folder.wrapped_key), "a": folder.attributes,
              "sk": base64url_encode(&wrap_key(&master, &share_key).unwrap()) },
            { "h": "pubFile1", "p": "pubRoot1", "t": 0, "u": ME, "s": data.len(),
              "k": format!("pubRoot1:{}", file.wrapped_key), "a": file.attributes },
        ]
    });
    let listing: NodeListing = serde_json::from_value(listing).unwrap();

    let owner_view = resolve_nodes(&session, &listing);
    let root = owner_view.iter().find(|n| n.handle.as_str() == "pubRoot1").unwrap();
    let url = root.public_link().unwrap().to_string();
    assert!(url.starts_with("https://mega.nz/folder/pubRoot1#"));

    // A visitor opens the link without an account.
    let link = PublicLink::parse(&url).unwrap();
    let visitor = Session::for_public_folder(&link).unwrap();
    let visitor_view = resolve_nodes(&visitor, &listing);

    let file_node = visitor_view
        .iter()
        .find(|n| n.handle == NodeHandle::from("pubFile1"))
        .unwrap();
    assert_eq!(file_node.name(), Some("notes.txt"));

    let mut download = file_node.decrypter(Cursor::new(ciphertext)).unwrap();
    let mut plaintext = Vec::new();
    copy_stream(&mut download, &mut plaintext, 16).unwrap();
    assert_eq!(plaintext, data);
}

#[test]
fn public_file_link_flow() {
    let data = make_data(123);
    let (ciphertext, file) = upload(&data, "tiny.txt", PackSize::default(), &[1u8; 16]);

    let url = PublicLink::file(NodeHandle::from("fileLnk1"), file.key.clone()).to_legacy_url();
    let link: PublicLink = url.parse().unwrap();
    let key = link.file_key().unwrap();

    for buffer in [16usize, 32, 123, 150, 20, 6133] {
        let mut download = AesCtrStream::for_file_key(Cursor::new(ciphertext.clone()), 123, key);
        let mut plaintext = Vec::new();
        copy_stream(&mut download, &mut plaintext, buffer).unwrap();
        assert_eq!(plaintext, data, "buffer {buffer}");
    }
}
