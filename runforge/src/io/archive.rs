//! Gzip-compressed tarballs of run directories.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter};
use std::path::Path;

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use tracing::debug;

/// Pack the contents of `dir` into `tarball` (entries are relative to `dir`).
///
/// Symlinks are stored as links, never followed out of the run directory.
pub fn compress_dir(dir: &Path, tarball: &Path) -> io::Result<()> {
    if let Some(parent) = tarball.parent() {
        fs::create_dir_all(parent)?;
    }
    let file = File::create(tarball)?;
    let encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);
    builder.append_dir_all(".", dir)?;
    let encoder = builder.into_inner()?;
    let writer = encoder.finish()?;
    let file = writer.into_inner().map_err(|err| err.into_error())?;
    file.sync_all()?;
    debug!(dir = %dir.display(), tarball = %tarball.display(), "run directory compressed");
    Ok(())
}

/// Unpack `tarball` into `dest`, creating it if needed.
pub fn extract_archive(tarball: &Path, dest: &Path) -> io::Result<()> {
    fs::create_dir_all(dest)?;
    let file = File::open(tarball)?;
    let mut archive = tar::Archive::new(GzDecoder::new(BufReader::new(file)));
    archive.set_preserve_permissions(true);
    archive.unpack(dest)?;
    debug!(tarball = %tarball.display(), dest = %dest.display(), "archive extracted");
    Ok(())
}
