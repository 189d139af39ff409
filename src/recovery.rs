
use std::fs::File;
use std::io::{self, BufRead, BufReader, Seek, SeekFrom, Write};
use std::path::Path;

use crate::errors::{Error, Result};
use crate::grammar::Grammar;
use crate::precompute::{read_field, read_flag, read_line, END_OF_DICTIONARIES, STREAM_VERSION};
use crate::queue::GuessQueue;

/// Nudges the restore window just past the checkpointed probability so the
/// pre-terminal that was in flight when the session stopped is regenerated
/// in full.
const RESTORE_EPSILON: f64 = 1e-16;

/// Everything a stopped session needs to reload itself: the ruleset, the
/// wordlist filters, the mode, and the wordlists with their priors.
#[derive(Clone, Debug, PartialEq)]
pub struct RecoveryConfig {
  pub rules: String,
  pub keep_upper: bool,
  pub keep_special: bool,
  pub keep_digits: bool,
  pub precompute_mode: u8,
  pub wordlists: Vec<(String, f64)>,
}

/// The crash file: a fixed header followed by the restore probability,
/// which is rewritten in place as the session advances.
pub struct RecoveryFile {
  file: File,
  mark: u64,
}

impl RecoveryFile {
  pub fn create(path: &Path, config: &RecoveryConfig, restore_point: f64) -> Result<RecoveryFile> {
    let mut file = File::create(path)?;
    writeln!(file, "Version:\t{}", STREAM_VERSION)?;
    writeln!(file, "Rules:\t{}", config.rules)?;
    writeln!(file, "KeepUpper:\t{}", config.keep_upper as u8)?;
    writeln!(file, "KeepSpecial:\t{}", config.keep_special as u8)?;
    writeln!(file, "KeepDigits:\t{}", config.keep_digits as u8)?;
    writeln!(file, "PreComputeMode:\t{}", config.precompute_mode)?;
    for (name, prior) in &config.wordlists {
      writeln!(file, "{}", name)?;
      writeln!(file, "{}", prior)?;
    }
    writeln!(file, "{}", END_OF_DICTIONARIES)?;
    let mark = file.stream_position()?;
    let mut recovery = RecoveryFile { file, mark };
    recovery.update(restore_point)?;
    Ok(recovery)
  }

  /// Rewrites the restore probability in place. The fixed precision keeps
  /// every write the same width, so no stale digits survive.
  pub fn update(&mut self, probability: f64) -> io::Result<()> {
    self.file.seek(SeekFrom::Start(self.mark))?;
    write!(self.file, "{:.16}", probability)?;
    self.file.flush()
  }

  pub fn load(path: &Path) -> Result<(RecoveryConfig, f64)> {
    let file = File::open(path).map_err(|e| {
      Error::input(format!("could not open recovery file {}: {}", path.display(), e))
    })?;
    let mut input = BufReader::new(file);

    let version: f64 = read_field(&mut input, "Version:")?
      .trim()
      .parse()
      .map_err(|_| Error::input("unparsable recovery file version"))?;
    if version < STREAM_VERSION {
      return Err(Error::input(format!(
        "recovery file version {} is no longer supported",
        version
      )));
    }
    let rules = read_field(&mut input, "Rules:")?;
    if rules.is_empty() {
      return Err(Error::input("empty rules name in recovery file"));
    }
    let keep_upper = read_flag(&mut input, "KeepUpper:")?;
    let keep_special = read_flag(&mut input, "KeepSpecial:")?;
    let keep_digits = read_flag(&mut input, "KeepDigits:")?;
    let precompute_mode: u8 = read_field(&mut input, "PreComputeMode:")?
      .trim()
      .parse()
      .map_err(|_| Error::input("unparsable PreComputeMode"))?;
    if precompute_mode > 2 {
      return Err(Error::input(format!("PreComputeMode {} out of range", precompute_mode)));
    }

    let mut wordlists = vec![];
    loop {
      let line = read_line(&mut input)?;
      if line == END_OF_DICTIONARIES {
        break;
      }
      let prior: f64 = read_line(&mut input)?
        .trim()
        .parse()
        .map_err(|_| Error::input(format!("unparsable prior for wordlist {:?}", line)))?;
      if !(prior > 0.0 && prior <= 1.0) {
        return Err(Error::probability(format!(
          "wordlist {:?} prior {} outside (0,1]",
          line, prior
        )));
      }
      wordlists.push((line, prior));
    }

    let mut rest = String::new();
    input.read_line(&mut rest)?;
    let restore_point: f64 = rest
      .trim()
      .parse()
      .map_err(|_| Error::input("unparsable restore probability"))?;

    Ok((
      RecoveryConfig { rules, keep_upper, keep_special, keep_digits, precompute_mode, wordlists },
      restore_point,
    ))
  }
}

/// Rebuilds the queue to where a stopped session left off: everything at or
/// just below the checkpointed probability comes back, everything above it
/// was already emitted.
pub fn restore(queue: &mut GuessQueue, grammar: &Grammar, restore_point: f64) {
  queue.rebuild(grammar, restore_point + RESTORE_EPSILON);
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::chains::{ChainBuilder, SymbolKind};
  use tempfile::TempDir;

  fn config() -> RecoveryConfig {
    RecoveryConfig {
      rules: "Default".to_owned(),
      keep_upper: false,
      keep_special: false,
      keep_digits: true,
      precompute_mode: 0,
      wordlists: vec![("common.txt".to_owned(), 0.9), ("extra.txt".to_owned(), 0.1)],
    }
  }

  #[test]
  fn create_update_load_roundtrip() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("save.rec");

    let mut rec = RecoveryFile::create(&path, &config(), 1.0).unwrap();
    rec.update(0.0625).unwrap();
    rec.update(0.03125).unwrap();

    let (loaded, restore_point) = RecoveryFile::load(&path).unwrap();
    assert_eq!(loaded, config());
    assert!((restore_point - 0.03125).abs() < 1e-12);
  }

  #[test]
  fn later_updates_leave_no_stale_digits() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("save.rec");

    let mut rec = RecoveryFile::create(&path, &config(), 0.9999999).unwrap();
    rec.update(0.1).unwrap();
    let (_, restore_point) = RecoveryFile::load(&path).unwrap();
    assert!((restore_point - 0.1).abs() < 1e-12);
  }

  #[test]
  fn missing_file_is_an_input_error() {
    let dir = TempDir::new().unwrap();
    assert!(matches!(
      RecoveryFile::load(&dir.path().join("absent.rec")),
      Err(Error::InputFormat(_))
    ));
  }

  #[test]
  fn restore_resumes_at_the_checkpoint() {
    let mut g = Grammar::new();
    let mut b = ChainBuilder::new("d");
    b.push_row("9".to_owned(), 0.9).unwrap();
    b.push_row("4".to_owned(), 0.4).unwrap();
    b.push_row("2".to_owned(), 0.2).unwrap();
    let d = g.add_chain(SymbolKind::Digit, 1, b.finish(SymbolKind::Digit, 1));
    g.add_structure(vec![d], 1.0);

    let mut q = GuessQueue::unbounded();
    q.seed(&g);
    restore(&mut q, &g, 0.4);

    // 0.9 was emitted before the stop; the checkpointed 0.4 comes back and
    // 0.2 follows by descent
    let mut pops = vec![];
    while let Some((pt, p)) = q.pop() {
      q.push_children(&g, &pt, p);
      pops.push(p);
    }
    assert_eq!(pops, vec![0.4, 0.2]);
  }
}
