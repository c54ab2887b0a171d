use std::io::Cursor;

use mega_crypto::{copy_stream, AesCtrStream, FileKey};

const KEY: [u8; 16] = [0x5A; 16];
const IV: [u8; 8] = [7; 8];

fn make_data(size: usize) -> Vec<u8> {
    (0..size)
        .map(|i| (i.wrapping_mul(7) ^ (i >> 3)) as u8)
        .collect()
}

fn encrypt(data: &[u8]) -> (Vec<u8>, FileKey) {
    let mut stream =
        AesCtrStream::encrypter_with_key(Cursor::new(data.to_vec()), data.len() as u64, KEY, IV);
    let mut out = Vec::with_capacity(data.len());
    copy_stream(&mut stream, &mut out, 64 * 1024).unwrap();
    let key = stream.node_key().unwrap();
    (out, key)
}

#[divan::bench(args = [1024, 65536, 1048576, 4194304])]
fn bench_encrypt_stream(bencher: divan::Bencher, size: usize) {
    let data = make_data(size);
    bencher
        .counter(divan::counter::BytesCount::new(size))
        .bench(|| encrypt(divan::black_box(&data)));
}

#[divan::bench(args = [1024, 65536, 1048576, 4194304])]
fn bench_decrypt_stream(bencher: divan::Bencher, size: usize) {
    let (ciphertext, key) = encrypt(&make_data(size));
    bencher
        .counter(divan::counter::BytesCount::new(size))
        .bench(|| {
            let mut stream = AesCtrStream::for_file_key(
                Cursor::new(divan::black_box(&ciphertext)),
                size as u64,
                &key,
            );
            copy_stream(&mut stream, &mut std::io::sink(), 64 * 1024).unwrap()
        });
}

#[divan::bench(args = [16, 4096, 65536])]
fn bench_decrypt_buffer_size(bencher: divan::Bencher, buffer: usize) {
    let size = 1024 * 1024;
    let (ciphertext, key) = encrypt(&make_data(size));
    bencher
        .counter(divan::counter::BytesCount::new(size))
        .bench(|| {
            let mut stream =
                AesCtrStream::for_file_key(Cursor::new(&ciphertext), size as u64, &key);
            copy_stream(&mut stream, &mut std::io::sink(), buffer).unwrap()
        });
}

fn main() {
    divan::main();
}
