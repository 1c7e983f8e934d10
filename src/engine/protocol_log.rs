use std::{
    fs::{self, File, OpenOptions},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use chrono::Local;

use crate::error::EngineError;

const MAX_LOG_FILES: u32 = 99_999;

/// Transcript of everything exchanged with one engine process.
pub struct ProtocolLog {
    path: PathBuf,
    writer: BufWriter<File>,
}

#[derive(Debug, Clone, Copy)]
pub enum Direction {
    ToEngine,
    FromEngine,
}

impl ProtocolLog {
    /// Opens `<dir>/<engine>_<NNNNN>.log` with the first free number.
    pub fn open(dir: &Path, engine_key: &str) -> Result<ProtocolLog, EngineError> {
        fs::create_dir_all(dir)?;
        let stem: String = engine_key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();

        for n in 1..=MAX_LOG_FILES {
            let path = dir.join(format!("{stem}_{n:05}.log"));
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => {
                    return Ok(ProtocolLog {
                        path,
                        writer: BufWriter::new(file),
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(EngineError::Io(std::io::Error::other(format!(
            "no free log file name for {stem} in {}",
            dir.display()
        ))))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write(&mut self, direction: Direction, line: &str) {
        let marker = match direction {
            Direction::ToEngine => ">>",
            Direction::FromEngine => "<<",
        };
        let _ = writeln!(
            self.writer,
            "{} {marker} {line}",
            Local::now().format("%H:%M:%S%.3f")
        );
    }

    pub fn flush(&mut self) {
        let _ = self.writer.flush();
    }
}

impl Drop for ProtocolLog {
    fn drop(&mut self) {
        self.flush();
    }
}
