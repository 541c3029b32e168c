//! ffmpeg invocations: concat demuxer merge and stream-copy transmux.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Instant;

use tokio::process::Command;
use tracing::{debug, info};

use crate::error::{DownloadError, Result};

/// `ffmpeg -y -i <merged> -c copy <output>`
pub fn transmux_args(merged: &Path, output: &Path) -> Vec<OsString> {
    vec![
        "-y".into(),
        "-i".into(),
        merged.as_os_str().to_owned(),
        "-c".into(),
        "copy".into(),
        output.as_os_str().to_owned(),
    ]
}

/// `ffmpeg -y -f concat -safe 0 -i <list> -c copy <merged>`
pub fn concat_args(list: &Path, merged: &Path) -> Vec<OsString> {
    vec![
        "-y".into(),
        "-f".into(),
        "concat".into(),
        "-safe".into(),
        "0".into(),
        "-i".into(),
        list.as_os_str().to_owned(),
        "-c".into(),
        "copy".into(),
        merged.as_os_str().to_owned(),
    ]
}

/// Input list for the concat demuxer. Single quotes are escaped the way ffmpeg expects.
pub fn concat_list(files: &[PathBuf]) -> String {
    files
        .iter()
        .map(|file| {
            let path = file.to_string_lossy().replace('\'', r"'\''");
            format!("file '{path}'\n")
        })
        .collect()
}

/// Repackage `merged` into `output` without re-encoding.
pub async fn transmux(ffmpeg: &Path, merged: &Path, output: &Path) -> Result<()> {
    info!(input = %merged.display(), output = %output.display(), "Transmuxing");
    run_ffmpeg(ffmpeg, &transmux_args(merged, output)).await
}

/// Merge segments with the concat demuxer. The list file is removed afterwards.
pub async fn concat(ffmpeg: &Path, files: &[PathBuf], merged: &Path) -> Result<()> {
    let mut list = merged.as_os_str().to_owned();
    list.push(".concat.txt");
    let list = PathBuf::from(list);

    tokio::fs::write(&list, concat_list(files)).await?;
    let result = run_ffmpeg(ffmpeg, &concat_args(&list, merged)).await;
    if let Err(e) = tokio::fs::remove_file(&list).await {
        debug!(path = %list.display(), error = %e, "Failed to remove concat list");
    }
    result
}

async fn run_ffmpeg(ffmpeg: &Path, args: &[OsString]) -> Result<()> {
    debug!("FFmpeg args: {:?}", args);
    let started = Instant::now();

    let mut cmd = Command::new(ffmpeg);
    cmd.args(args)
        .env("LC_ALL", "C")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output = cmd.output().await.map_err(|e| DownloadError::Ffmpeg {
        reason: format!("failed to start {}: {e}", ffmpeg.display()),
    })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let last_line = stderr
            .lines()
            .rev()
            .find(|line| !line.trim().is_empty())
            .unwrap_or("Unknown ffmpeg error");
        return Err(DownloadError::Ffmpeg {
            reason: format!(
                "exit code {}: {}",
                output.status.code().unwrap_or(-1),
                last_line
            ),
        });
    }

    debug!(elapsed_ms = started.elapsed().as_millis() as u64, "ffmpeg finished");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transmux_copies_streams() {
        let args = transmux_args(Path::new("/tmp/merged.ts"), Path::new("out.mp4"));
        let args: Vec<String> = args.iter().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(args, ["-y", "-i", "/tmp/merged.ts", "-c", "copy", "out.mp4"]);
    }

    #[test]
    fn concat_list_quotes_paths() {
        let files = vec![PathBuf::from("/tmp/a/1.ts"), PathBuf::from("/tmp/it's/2.ts")];
        assert_eq!(
            concat_list(&files),
            "file '/tmp/a/1.ts'\nfile '/tmp/it'\\''s/2.ts'\n"
        );
    }

    #[tokio::test]
    async fn missing_binary_is_an_ffmpeg_error() {
        let err = transmux(
            Path::new("/nonexistent/bin/ffmpeg-for-tests"),
            Path::new("in.ts"),
            Path::new("out.mp4"),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, DownloadError::Ffmpeg { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn non_zero_exit_is_an_ffmpeg_error() {
        let err = run_ffmpeg(Path::new("false"), &[]).await.unwrap_err();
        let DownloadError::Ffmpeg { reason } = err else {
            panic!("expected ffmpeg error");
        };
        assert!(reason.starts_with("exit code 1"));
    }
}
