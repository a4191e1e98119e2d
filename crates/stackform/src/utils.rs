//! Digests of synthesized templates.
use std::{io::Read, path::Path};

/// Uppercase hex sha256 of everything `reader` yields.
fn sha256_reader(mut reader: impl Read) -> std::io::Result<String> {
    let mut context = ring::digest::Context::new(&ring::digest::SHA256);
    let mut buffer = [0; 4096];
    loop {
        match reader.read(&mut buffer)? {
            0 => break,
            count => context.update(&buffer[..count]),
        }
    }
    Ok(data_encoding::HEXUPPER.encode(context.finish().as_ref()))
}

/// Uppercase hex sha256 of `bytes`, as recorded in the assembly manifest.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let digest = ring::digest::digest(&ring::digest::SHA256, bytes);
    data_encoding::HEXUPPER.encode(digest.as_ref())
}

/// Digest of the file at `path`, or `None` if there is no such file.
///
/// [`Assembly::write`](crate::synth::Assembly::write) compares it with a
/// fresh template to skip rewriting unchanged stacks.
pub fn file_digest(path: impl AsRef<Path>) -> std::io::Result<Option<String>> {
    let path = path.as_ref();
    log::trace!("digesting {path:?}");
    if !path.is_file() {
        return Ok(None);
    }
    let file = std::fs::File::open(path)?;
    sha256_reader(std::io::BufReader::new(file)).map(Some)
}
