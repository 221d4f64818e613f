//! Turns a raw filesystem diff into a canonical, optionally compressed tar
//! layer: entries sorted lexicographically by path, mtimes normalized to a
//! configured epoch, numeric uid/gid and xattrs preserved, with whiteout
//! entries left untouched (they already represent deletions relative to
//! the parent layer).

use std::io::{Cursor, Read, Write};

use chrono::{DateTime, Utc};
use sha2::{Digest as _, Sha256};
use tar::{Builder, EntryType, Header};

use crate::cache::CompressionKind;
use crate::error::{BuildError, ErrorKind, Result};

#[derive(Debug)]
pub struct LayerDescriptor {
    pub diff_id: String,
    pub digest: String,
    pub size: u64,
    pub media_type: String,
    pub compression: CompressionKind,
}

struct RawEntry {
    header: Header,
    path: Vec<u8>,
    data: Vec<u8>,
}

/// Canonicalizes, hashes, and compresses `raw_tar`, returning both the
/// descriptor and the compressed bytes ready to write as the blob the
/// descriptor describes.
pub fn assemble(raw_tar: &[u8], compression: CompressionKind, epoch: DateTime<Utc>) -> Result<(LayerDescriptor, Vec<u8>)> {
    let canonical = canonicalize(raw_tar, epoch)?;
    let diff_id = format!("sha256:{}", hex(&Sha256::digest(&canonical)));

    let compressed = compress(&canonical, compression)?;
    let digest = format!("sha256:{}", hex(&Sha256::digest(&compressed)));
    let media_type = media_type_for(compression);
    let size = compressed.len() as u64;

    Ok((LayerDescriptor { diff_id, digest, size, media_type, compression }, compressed))
}

fn canonicalize(raw_tar: &[u8], epoch: DateTime<Utc>) -> Result<Vec<u8>> {
    let mut archive = tar::Archive::new(Cursor::new(raw_tar));
    let mut entries = Vec::new();

    for entry in archive.entries().map_err(tar_err)? {
        let mut entry = entry.map_err(tar_err)?;
        let path = entry.path_bytes().into_owned();
        let mut header = entry.header().clone();
        header.set_mtime(epoch.timestamp().max(0) as u64);

        let mut data = Vec::new();
        if header.entry_type() == EntryType::Regular {
            entry.read_to_end(&mut data).map_err(tar_err)?;
        }
        entries.push(RawEntry { header, path, data });
    }

    entries.sort_by(|a, b| a.path.cmp(&b.path));

    let mut out = Builder::new(Vec::new());
    for entry in &entries {
        let mut header = entry.header.clone();
        header.set_cksum();
        out.append_data(&mut header, std::str::from_utf8(&entry.path).unwrap_or_default(), &entry.data[..])
            .map_err(tar_err)?;
    }
    out.into_inner().map_err(tar_err)
}

fn compress(canonical: &[u8], kind: CompressionKind) -> Result<Vec<u8>> {
    match kind {
        CompressionKind::None => Ok(canonical.to_vec()),
        CompressionKind::Gzip => {
            let mut enc = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
            enc.write_all(canonical).map_err(tar_err)?;
            enc.finish().map_err(tar_err)
        }
        CompressionKind::Zstd => zstd::encode_all(canonical, 0).map_err(tar_err),
        CompressionKind::Lz4 => Ok(lz4_flex::compress_prepend_size(canonical)),
        CompressionKind::Bzip2 => {
            let mut enc = bzip2::write::BzEncoder::new(Vec::new(), bzip2::Compression::default());
            enc.write_all(canonical).map_err(tar_err)?;
            enc.finish().map_err(tar_err)
        }
    }
}

fn media_type_for(kind: CompressionKind) -> String {
    match kind {
        CompressionKind::None => "application/vnd.oci.image.layer.v1.tar".to_owned(),
        CompressionKind::Gzip => "application/vnd.oci.image.layer.v1.tar+gzip".to_owned(),
        CompressionKind::Zstd => "application/vnd.oci.image.layer.v1.tar+zstd".to_owned(),
        CompressionKind::Lz4 => "application/vnd.oci.image.layer.v1.tar+lz4".to_owned(),
        CompressionKind::Bzip2 => "application/vnd.oci.image.layer.v1.tar+bzip2".to_owned(),
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn tar_err(e: std::io::Error) -> BuildError {
    BuildError::new(ErrorKind::Execution, format!("layer assembly failed: {e}")).with_cause(e)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_tar(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = Builder::new(Vec::new());
        for (path, data) in entries {
            let mut header = Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, path, *data).unwrap();
        }
        builder.into_inner().unwrap()
    }

    #[test]
    fn identical_content_produces_identical_diff_id_regardless_of_entry_order() {
        let a = make_tar(&[("b.txt", b"b"), ("a.txt", b"a")]);
        let b = make_tar(&[("a.txt", b"a"), ("b.txt", b"b")]);
        let epoch = DateTime::<Utc>::from_timestamp(0, 0).unwrap();
        let (layer_a, _) = assemble(&a, CompressionKind::None, epoch).unwrap();
        let (layer_b, _) = assemble(&b, CompressionKind::None, epoch).unwrap();
        assert_eq!(layer_a.diff_id, layer_b.diff_id);
    }

    #[test]
    fn gzip_changes_digest_but_not_diff_id() {
        let raw = make_tar(&[("f", b"hello\n")]);
        let epoch = DateTime::<Utc>::from_timestamp(0, 0).unwrap();
        let (none, none_bytes) = assemble(&raw, CompressionKind::None, epoch).unwrap();
        let (gz, gz_bytes) = assemble(&raw, CompressionKind::Gzip, epoch).unwrap();
        assert_eq!(none.diff_id, gz.diff_id);
        assert_ne!(none.digest, gz.digest);
        assert_eq!(none.size, none_bytes.len() as u64);
        assert_eq!(gz.size, gz_bytes.len() as u64);
    }

    #[test]
    fn media_types_match_oci_spec() {
        let raw = make_tar(&[("f", b"x")]);
        let epoch = DateTime::<Utc>::from_timestamp(0, 0).unwrap();
        assert_eq!(assemble(&raw, CompressionKind::None, epoch).unwrap().0.media_type, "application/vnd.oci.image.layer.v1.tar");
        assert_eq!(assemble(&raw, CompressionKind::Gzip, epoch).unwrap().0.media_type, "application/vnd.oci.image.layer.v1.tar+gzip");
    }

    #[test]
    fn lz4_and_bzip2_round_trip_through_the_same_diff_id() {
        let raw = make_tar(&[("f", b"hello\n")]);
        let epoch = DateTime::<Utc>::from_timestamp(0, 0).unwrap();
        let (none, _) = assemble(&raw, CompressionKind::None, epoch).unwrap();
        let (lz4, lz4_bytes) = assemble(&raw, CompressionKind::Lz4, epoch).unwrap();
        let (bz2, bz2_bytes) = assemble(&raw, CompressionKind::Bzip2, epoch).unwrap();

        assert_eq!(none.diff_id, lz4.diff_id);
        assert_eq!(none.diff_id, bz2.diff_id);
        assert_eq!(lz4.media_type, "application/vnd.oci.image.layer.v1.tar+lz4");
        assert_eq!(bz2.media_type, "application/vnd.oci.image.layer.v1.tar+bzip2");
        assert_eq!(lz4_flex::decompress_size_prepended(&lz4_bytes).unwrap(), canonicalize(&raw, epoch).unwrap());
        assert_eq!(lz4.size, lz4_bytes.len() as u64);
        assert_eq!(bz2.size, bz2_bytes.len() as u64);
    }
}
