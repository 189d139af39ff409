
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use log::{debug, warn};

use crate::chains::{ChainBuilder, CharsetKind, ReplaceRule, SymbolKind, TerminalChain, MAX_LEN};
use crate::errors::{Error, Result};

/// Loads one symbol kind's probability directory: `<length>.txt` holds
/// `replacement\tprobability` rows grouped by probability, `NotFound.txt`
/// holds `length\tprobability` smoothing rows that seed brute-force groups
/// for lengths the training set never saw.
pub fn load_kind_dir(dir: &Path, kind: SymbolKind) -> Result<Vec<Option<TerminalChain>>> {
  let mut builders: Vec<Option<ChainBuilder>> = (0..=MAX_LEN).map(|_| None).collect();
  let mut any = false;

  for length in 1..=MAX_LEN {
    let path = dir.join(format!("{}.txt", length));
    let file = match File::open(&path) {
      Ok(f) => f,
      Err(_) => continue,
    };
    any = true;
    let mut builder = ChainBuilder::new(path.display().to_string());
    for line in BufReader::new(file).lines() {
      let line = line?;
      let line = line.strip_suffix('\r').unwrap_or(&line);
      let Some((replacement, prob)) = line.split_once('\t') else {
        if !line.is_empty() {
          debug!("{}: skipping line without a tab", path.display());
        }
        continue;
      };
      let probability: f64 = prob.trim().parse().map_err(|_| {
        Error::input(format!("{}: unparsable probability {:?}", path.display(), prob))
      })?;
      builder.push_row(replacement.to_owned(), probability)?;
    }
    builders[length] = Some(builder);
  }
  if !any {
    return Err(Error::input(format!(
      "no probability files found under {}",
      dir.display()
    )));
  }

  apply_smoothing(dir, kind, &mut builders)?;

  let mut chains: Vec<Option<TerminalChain>> = vec![None; MAX_LEN + 1];
  for (length, builder) in builders.into_iter().enumerate() {
    let Some(builder) = builder else { continue };
    if builder.is_empty() {
      continue;
    }
    let mut chain = builder.finish(kind, length);
    if kind == SymbolKind::Capitalization {
      detect_mask_rules(&mut chain);
    }
    chain.validate()?;
    chains[length] = Some(chain);
  }
  Ok(chains)
}

/// Reads `NotFound.txt` and appends a brute-force group per smoothed length.
/// A zero probability means the length stays unsmoothed.
fn apply_smoothing(
  dir: &Path,
  kind: SymbolKind,
  builders: &mut [Option<ChainBuilder>],
) -> Result<()> {
  let path = dir.join("NotFound.txt");
  let file = File::open(&path).map_err(|e| {
    Error::input(format!("could not open smoothing file {}: {}", path.display(), e))
  })?;
  let charset = CharsetKind::for_symbol(kind);

  for line in BufReader::new(file).lines() {
    let line = line?;
    let line = line.strip_suffix('\r').unwrap_or(&line);
    let Some((length, prob)) = line.split_once('\t') else { continue };
    let length: usize = length.trim().parse().map_err(|_| {
      Error::input(format!("{}: unparsable length {:?}", path.display(), length))
    })?;
    let probability: f64 = prob.trim().parse().map_err(|_| {
      Error::input(format!("{}: unparsable probability {:?}", path.display(), prob))
    })?;
    if probability == 0.0 {
      continue;
    }
    if length == 0 || length > MAX_LEN {
      warn!("{}: ignoring smoothing row for length {}", path.display(), length);
      continue;
    }
    builders[length]
      .get_or_insert_with(|| ChainBuilder::new(format!("{} length {}", path.display(), length)))
      .push_brute(charset, length, probability)?;
  }
  Ok(())
}

/// Capitalization groups apply their replacements as case masks. A group
/// whose only replacement never uppercases anything is flagged so the
/// materializer can skip the transformation entirely.
fn detect_mask_rules(chain: &mut TerminalChain) {
  for group in &mut chain.groups {
    if group.brute.is_some() {
      continue;
    }
    group.rule = if group.replacements.len() == 1 && !group.replacements[0].contains('U') {
      ReplaceRule::Lowercase
    } else {
      ReplaceRule::Mask
    };
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::fs;
  use tempfile::TempDir;

  fn kind_dir(files: &[(&str, &str)]) -> TempDir {
    let dir = TempDir::new().unwrap();
    for (name, contents) in files {
      fs::write(dir.path().join(name), contents).unwrap();
    }
    dir
  }

  #[test]
  fn loads_length_files_and_groups() {
    let dir = kind_dir(&[
      ("1.txt", "1\t0.6\n2\t0.2\n3\t0.2\n"),
      ("NotFound.txt", "2\t0.01\n"),
    ]);
    let chains = load_kind_dir(dir.path(), SymbolKind::Digit).unwrap();

    let one = chains[1].as_ref().unwrap();
    assert_eq!(one.groups.len(), 2);
    assert_eq!(one.groups[1].replacements, vec!["2", "3"]);
    assert!(one.groups.iter().all(|g| g.brute.is_none()));

    // Length 2 exists only through smoothing.
    let two = chains[2].as_ref().unwrap();
    assert_eq!(two.groups.len(), 1);
    let brute = two.groups[0].brute.unwrap();
    assert_eq!(brute.charset, CharsetKind::Digit);
    assert_eq!(brute.length, 2);
    assert_eq!(two.groups[0].replacements, vec!["00"]);
    assert_eq!(two.groups[0].probability, 0.01);
  }

  #[test]
  fn smoothing_appends_to_existing_chain() {
    let dir = kind_dir(&[
      ("2.txt", "12\t0.5\n"),
      ("NotFound.txt", "2\t0.1\n3\t0\n"),
    ]);
    let chains = load_kind_dir(dir.path(), SymbolKind::Digit).unwrap();
    let two = chains[2].as_ref().unwrap();
    assert_eq!(two.groups.len(), 2);
    assert!(two.groups[0].brute.is_none());
    assert!(two.groups[1].brute.is_some());
    // The zero row leaves length 3 alone.
    assert!(chains[3].is_none());
  }

  #[test]
  fn capitalization_rules_are_detected() {
    let dir = kind_dir(&[
      ("3.txt", "LLL\t0.7\nULL\t0.2\nLUL\t0.2\nUUU\t0.05\n"),
      ("NotFound.txt", ""),
    ]);
    let chains = load_kind_dir(dir.path(), SymbolKind::Capitalization).unwrap();
    let three = chains[3].as_ref().unwrap();
    assert_eq!(three.groups.len(), 3);
    assert_eq!(three.groups[0].rule, ReplaceRule::Lowercase);
    assert_eq!(three.groups[1].rule, ReplaceRule::Mask);
    assert_eq!(three.groups[2].rule, ReplaceRule::Mask);
  }

  #[test]
  fn missing_directory_is_an_input_error() {
    let dir = TempDir::new().unwrap();
    assert!(matches!(
      load_kind_dir(dir.path(), SymbolKind::Digit),
      Err(Error::InputFormat(_))
    ));
  }

  #[test]
  fn unsorted_rows_are_rejected() {
    let dir = kind_dir(&[("1.txt", "1\t0.2\n2\t0.5\n"), ("NotFound.txt", "")]);
    assert!(matches!(
      load_kind_dir(dir.path(), SymbolKind::Digit),
      Err(Error::InputFormat(_))
    ));
  }
}
