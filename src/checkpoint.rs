use chrono::Local;
use std::env;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::checkpoint_uring;
use crate::family::SequenceFamily;

/// Survivor count above which the io_uring bulk writer is worth its setup
/// cost; smaller checkpoints go through a plain BufWriter.
const URING_MIN_SURVIVORS: usize = 64 * 1024;

/// Serialized block size for batched checkpoint writing.
const BLOCK_SIZE: usize = 256 * 1024;

pub fn get_data_dir() -> PathBuf {
    let xdg_data_home = env::var("XDG_DATA_HOME")
        .ok()
        .and_then(|path| {
            if path.is_empty() {
                None
            } else {
                Some(PathBuf::from(path))
            }
        })
        .or_else(|| {
            env::var("HOME")
                .ok()
                .map(|home| PathBuf::from(home).join(".local/share"))
        })
        .expect("Could not determine data directory");

    xdg_data_home.join("tdsieve")
}

/// Append one line per completed run to the run log in the data dir.
pub fn log_run(
    family: &str,
    args: &str,
    duration_us: u128,
    factors_found: u64,
) -> std::io::Result<()> {
    let data_dir = get_data_dir();
    fs::create_dir_all(&data_dir)?;

    let log_path = data_dir.join("run_log.txt");
    let mut file = OpenOptions::new().create(true).append(true).open(log_path)?;

    let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S");

    writeln!(
        file,
        "{} | {} | {} | {} factors | {}us",
        timestamp, family, args, factors_found, duration_us
    )?;

    Ok(())
}

/// Append-only factor file shared by all workers. One line per discovered
/// factor, flushed immediately so a crash loses nothing already found.
pub struct FactorLog {
    writer: Mutex<Option<BufWriter<File>>>,
}

impl FactorLog {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(FactorLog {
            writer: Mutex::new(Some(BufWriter::new(file))),
        })
    }

    /// A log that drops everything; for embedding and tests.
    pub fn disabled() -> Self {
        FactorLog {
            writer: Mutex::new(None),
        }
    }

    pub fn log(&self, prime: u64, term: &str) -> std::io::Result<()> {
        let mut guard = match self.writer.lock() {
            Ok(guard) => guard,
            Err(_) => {
                eprintln!("Error: factor log lock poisoned");
                std::process::exit(1);
            }
        };

        if let Some(writer) = guard.as_mut() {
            let mut itoa_buf = itoa::Buffer::new();
            writer.write_all(itoa_buf.format(prime).as_bytes())?;
            writer.write_all(b" | ")?;
            writer.write_all(term.as_bytes())?;
            writer.write_all(b"\n")?;
            writer.flush()?;
        }
        Ok(())
    }
}

/// Parse a factor file back into (prime, term) pairs for pre-run replay.
pub fn read_factor_file(path: &Path) -> std::io::Result<Vec<(u64, String)>> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);

    let mut out = Vec::new();
    for line in reader.lines() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let Some((prime_text, term)) = trimmed.split_once(" | ") else {
            eprintln!("Error: malformed factor line: {}", trimmed);
            std::process::exit(1);
        };
        let Ok(prime) = prime_text.parse::<u64>() else {
            eprintln!("Error: malformed factor line: {}", trimmed);
            std::process::exit(1);
        };
        out.push((prime, term.to_string()));
    }
    Ok(out)
}

/// Write a checkpoint: header line naming the form and the last fully
/// sieved prime, then one surviving candidate per line. The file is written
/// to a temporary name and renamed into place so a crash mid-write can never
/// destroy the previous checkpoint.
pub fn write_checkpoint(
    path: &Path,
    family: &dyn SequenceFamily,
    watermark: u64,
    survivors: &[u64],
    use_uring: bool,
) -> std::io::Result<usize> {
    let tmp_path = tmp_name(path);

    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&tmp_path)?;

    // Serialize in blocks: build text in memory, hand off full blocks
    let mut block = String::with_capacity(BLOCK_SIZE + 128);
    let mut blocks: Vec<Vec<u8>> = Vec::new();
    let mut itoa_buf = itoa::Buffer::new();

    block.push_str(&family.form());
    block.push_str(" sieved to ");
    block.push_str(itoa_buf.format(watermark));
    block.push('\n');

    for &key in survivors {
        family.push_candidate(key, &mut block);
        block.push('\n');
        if block.len() >= BLOCK_SIZE {
            blocks.push(std::mem::take(&mut block).into_bytes());
        }
    }
    if !block.is_empty() {
        blocks.push(block.into_bytes());
    }

    let file = if use_uring && survivors.len() >= URING_MIN_SURVIVORS {
        checkpoint_uring::write_blocks(file, blocks)?
    } else {
        let mut writer = BufWriter::with_capacity(BLOCK_SIZE, file);
        for b in &blocks {
            writer.write_all(b)?;
        }
        writer.flush()?;
        writer.into_inner().map_err(|e| e.into_error())?
    };

    file.sync_all()?;
    drop(file);
    fs::rename(&tmp_path, path)?;

    Ok(survivors.len())
}

/// Read a checkpoint written by `write_checkpoint`. The header form must
/// match the requested family; anything else is a configuration error.
pub fn read_checkpoint(
    path: &Path,
    family: &dyn SequenceFamily,
) -> std::io::Result<(u64, Vec<u64>)> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);

    let mut header = String::new();
    reader.read_line(&mut header)?;
    let header = header.trim_end();

    let Some((form, watermark_text)) = header.rsplit_once(" sieved to ") else {
        eprintln!("Error: {} is not a checkpoint file (bad header)", path.display());
        std::process::exit(1);
    };
    if form != family.form() {
        eprintln!(
            "Error: checkpoint is for {} but this run sieves {}",
            form,
            family.form()
        );
        std::process::exit(1);
    }
    let Ok(watermark) = watermark_text.parse::<u64>() else {
        eprintln!("Error: bad watermark in checkpoint header: {}", watermark_text);
        std::process::exit(1);
    };

    let mut keys = Vec::new();
    for line in reader.lines() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match family.parse_candidate(trimmed) {
            Some(key) => keys.push(key),
            None => {
                eprintln!("Error: checkpoint line is not a {} candidate: {}", family.form(), trimmed);
                std::process::exit(1);
            }
        }
    }

    Ok((watermark, keys))
}

fn tmp_name(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".tmp");
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::family::{self, FamilyOptions};

    fn temp_path(name: &str) -> PathBuf {
        let dir = env::temp_dir().join(format!("tdsieve_test_{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        dir.join(name)
    }

    fn kbn_family() -> std::sync::Arc<dyn SequenceFamily> {
        family::create(FamilyOptions::Kbn {
            k: 5,
            b: 2,
            c: 1,
            n_min: 10,
            n_max: 30,
            vector_below: 0,
        })
    }

    #[test]
    fn test_checkpoint_round_trip() {
        let fam = kbn_family();
        let path = temp_path("round_trip.txt");

        let survivors = vec![0, 3, 7, 20];
        let written = write_checkpoint(&path, fam.as_ref(), 12345, &survivors, false).unwrap();
        assert_eq!(written, 4);

        let (watermark, keys) = read_checkpoint(&path, fam.as_ref()).unwrap();
        assert_eq!(watermark, 12345);
        assert_eq!(keys, survivors);

        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_checkpoint_is_plain_text() {
        let fam = kbn_family();
        let path = temp_path("plain_text.txt");

        write_checkpoint(&path, fam.as_ref(), 97, &[0, 1], false).unwrap();
        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content, "5*2^n+1 sieved to 97\n5*2^10+1\n5*2^11+1\n");

        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_checkpoint_replaces_previous_atomically() {
        let fam = kbn_family();
        let path = temp_path("atomic.txt");

        write_checkpoint(&path, fam.as_ref(), 100, &[0, 1, 2], false).unwrap();
        write_checkpoint(&path, fam.as_ref(), 200, &[0, 2], false).unwrap();

        let (watermark, keys) = read_checkpoint(&path, fam.as_ref()).unwrap();
        assert_eq!(watermark, 200);
        assert_eq!(keys, vec![0, 2]);
        // No stale temporary left behind
        assert!(!tmp_name(&path).exists());

        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_factor_log_format_and_replay() {
        let path = temp_path("factors.txt");
        let _ = fs::remove_file(&path);

        let log = FactorLog::open(&path).unwrap();
        log.log(97, "5*2^42+1").unwrap();
        log.log(1000003, "5*2^17+1").unwrap();
        drop(log);

        let replay = read_factor_file(&path).unwrap();
        assert_eq!(
            replay,
            vec![
                (97, "5*2^42+1".to_string()),
                (1000003, "5*2^17+1".to_string())
            ]
        );

        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_disabled_factor_log_is_silent() {
        let log = FactorLog::disabled();
        log.log(7, "5*2^12+1").unwrap();
    }
}
