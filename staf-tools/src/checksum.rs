//! Content checksum helpers.

use std::io::Read;
use std::path::Path;

use anyhow::{format_err, Error};
use openssl::hash::{Hasher, MessageDigest};

/// Calculate the md5sum from a readable object.
///
/// The STAF archive uses the hex encoded md5sum as stored file name, so
/// this is not used for anything security relevant.
pub fn md5(file: &mut dyn Read) -> Result<([u8; 16], u64), Error> {
    let mut hasher = Hasher::new(MessageDigest::md5())?;
    let mut buffer = vec![0u8; 256 * 1024];
    let mut size: u64 = 0;

    loop {
        let count = match file.read(&mut buffer) {
            Ok(0) => break,
            Ok(count) => count,
            Err(ref err) if err.kind() == std::io::ErrorKind::Interrupted => {
                continue;
            }
            Err(err) => return Err(err.into()),
        };
        size += count as u64;
        hasher.update(&buffer[..count])?;
    }

    let digest = hasher.finish()?;
    let mut csum = [0u8; 16];
    csum.copy_from_slice(&digest);

    Ok((csum, size))
}

/// Returns the hex encoded md5sum and the size of a file.
pub fn file_md5_hex<P: AsRef<Path>>(path: P) -> Result<(String, u64), Error> {
    let path = path.as_ref();
    let mut file = std::fs::File::open(path)
        .map_err(|err| format_err!("unable to open {:?} - {}", path, err))?;
    let (csum, size) = md5(&mut file)?;
    Ok((hex::encode(csum), size))
}
