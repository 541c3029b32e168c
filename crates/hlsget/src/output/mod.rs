//! Turning a directory of segment files into one output file.

pub mod ffmpeg;

use std::cmp::Ordering;
use std::iter::Peekable;
use std::path::{Path, PathBuf};
use std::str::Chars;

use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, info, warn};

use crate::error::Result;

pub use ffmpeg::transmux;

const SEGMENT_EXTENSION: &str = "ts";

/// How segment files are joined into the intermediate merged file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
pub enum MergeStrategy {
    /// Byte-for-byte concatenation
    #[default]
    Concat,
    /// ffmpeg concat demuxer
    Ffmpeg,
}

/// Compare names treating runs of ASCII digits as numbers, so `seg9` sorts before `seg10`.
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let mut a = a.chars().peekable();
    let mut b = b.chars().peekable();
    loop {
        match (a.peek().copied(), b.peek().copied()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) if x.is_ascii_digit() && y.is_ascii_digit() => {
                let na = take_digits(&mut a);
                let nb = take_digits(&mut b);
                let ta = na.trim_start_matches('0');
                let tb = nb.trim_start_matches('0');
                let ord = ta
                    .len()
                    .cmp(&tb.len())
                    .then_with(|| ta.cmp(tb))
                    .then_with(|| na.len().cmp(&nb.len()));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            (Some(x), Some(y)) => {
                if x != y {
                    return x.cmp(&y);
                }
                a.next();
                b.next();
            }
        }
    }
}

fn take_digits(chars: &mut Peekable<Chars<'_>>) -> String {
    let mut digits = String::new();
    while let Some(c) = chars.next_if(char::is_ascii_digit) {
        digits.push(c);
    }
    digits
}

/// Segment files in `dir`, in publication order. Partial downloads are skipped.
pub async fn sorted_segment_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = tokio::fs::read_dir(dir).await?;
    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if !entry.file_type().await?.is_file() {
            continue;
        }
        if path.extension().and_then(|e| e.to_str()) == Some(SEGMENT_EXTENSION) {
            files.push(path);
        }
    }
    files.sort_by(|a, b| {
        natural_cmp(
            &a.file_name().unwrap_or_default().to_string_lossy(),
            &b.file_name().unwrap_or_default().to_string_lossy(),
        )
    });
    Ok(files)
}

/// Append every file to `merged`, in order. Returns the number of bytes written.
pub async fn concat_files(files: &[PathBuf], merged: &Path) -> Result<u64> {
    let mut writer = BufWriter::new(File::create(merged).await?);
    let mut total = 0;
    for path in files {
        let mut reader = File::open(path).await?;
        total += tokio::io::copy(&mut reader, &mut writer).await?;
    }
    writer.flush().await?;
    writer.into_inner().sync_all().await?;
    Ok(total)
}

/// Join the segment files into `merged` with the chosen strategy.
pub async fn merge_segments(
    strategy: MergeStrategy,
    ffmpeg_path: &Path,
    files: &[PathBuf],
    merged: &Path,
) -> Result<()> {
    info!(
        segments = files.len(),
        ?strategy,
        merged = %merged.display(),
        "Merging segments"
    );
    match strategy {
        MergeStrategy::Concat => {
            let bytes = concat_files(files, merged).await?;
            debug!(bytes, "Concatenated segments");
            Ok(())
        }
        MergeStrategy::Ffmpeg => ffmpeg::concat(ffmpeg_path, files, merged).await,
    }
}

/// Move `from` to `to`, copying when a rename is not possible (e.g. across filesystems).
pub async fn move_file(from: &Path, to: &Path) -> Result<()> {
    if let Err(e) = tokio::fs::rename(from, to).await {
        debug!(error = %e, "Rename failed, copying instead");
        tokio::fs::copy(from, to).await?;
        if let Err(e) = tokio::fs::remove_file(from).await {
            warn!(path = %from.display(), error = %e, "Failed to remove source after copy");
        }
    }
    Ok(())
}
