
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::chains::{ChainBuilder, SymbolKind};
use crate::errors::{Error, Result};
use crate::grammar::Grammar;

/// Part-of-speech tags that share one phrase dictionary. Several tags map
/// onto the same dictionary when the training corpus distinguishes more
/// grammatical roles than separate wordlists are worth.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TagGroup {
  pub tags: Vec<String>,
  pub dictionary: String,
}

pub fn load_tagset(path: &Path) -> Result<Vec<TagGroup>> {
  let file = File::open(path)
    .map_err(|e| Error::input(format!("could not open tagset {}: {}", path.display(), e)))?;
  serde_json::from_reader(BufReader::new(file))
    .map_err(|e| Error::input(format!("malformed tagset {}: {}", path.display(), e)))
}

#[derive(Clone, Debug)]
pub struct PassphraseConfig {
  pub base_dir: PathBuf,
  pub tagset: PathBuf,
  /// Phrase structures with fewer slots than this are dropped at load; very
  /// short phrases make poor passphrase guesses.
  pub min_slots: usize,
}

pub const DEFAULT_MIN_SLOTS: usize = 5;

/// Loads the passphrase grammar: one named chain per phrase dictionary
/// under `<base>/Phrases/`, then the phrase structure file, whose rows are
/// space-separated tag sequences.
pub fn load_passphrase_grammar(config: &PassphraseConfig) -> Result<Grammar> {
  let tagset = load_tagset(&config.tagset)?;
  let phrases = config.base_dir.join("Phrases");

  let mut grammar = Grammar::new();
  let mut by_tag: HashMap<String, String> = HashMap::new();
  for group in &tagset {
    for tag in &group.tags {
      by_tag.insert(tag.clone(), group.dictionary.clone());
    }
    if grammar.named_chain(&group.dictionary).is_none() {
      let chain = load_phrase_dictionary(&phrases.join(format!("{}.txt", group.dictionary)))?;
      grammar.add_named_chain(&group.dictionary, chain);
    }
  }

  let grammar_file = phrases.join("Grammar.txt");
  let file = File::open(&grammar_file).map_err(|e| {
    Error::input(format!("could not open phrase grammar {}: {}", grammar_file.display(), e))
  })?;
  for line in BufReader::new(file).lines() {
    let line = line?;
    let _ = bind_phrase_row(&mut grammar, &by_tag, &line, config.min_slots)?;
  }
  if grammar.structures.is_empty() {
    return Err(Error::input(format!(
      "no usable phrase structures in {}",
      grammar_file.display()
    )));
  }
  Ok(grammar)
}

fn load_phrase_dictionary(path: &Path) -> Result<crate::chains::TerminalChain> {
  let file = File::open(path).map_err(|e| {
    Error::input(format!("could not open phrase dictionary {}: {}", path.display(), e))
  })?;
  let mut builder = ChainBuilder::new(path.display().to_string());
  for line in BufReader::new(file).lines() {
    let line = line?;
    let line = line.strip_suffix('\r').unwrap_or(&line);
    let Some((word, prob)) = line.split_once('\t') else { continue };
    let probability: f64 = prob.trim().parse().map_err(|_| {
      Error::input(format!("{}: unparsable probability {:?}", path.display(), prob))
    })?;
    builder.push_row(word.to_owned(), probability)?;
  }
  if builder.is_empty() {
    return Err(Error::input(format!("phrase dictionary {} is empty", path.display())));
  }
  Ok(builder.finish(SymbolKind::Word, 0))
}

fn bind_phrase_row(
  grammar: &mut Grammar,
  by_tag: &HashMap<String, String>,
  line: &str,
  min_slots: usize,
) -> Result<Option<usize>> {
  let line = line.strip_suffix('\r').unwrap_or(line);
  let Some((tags, prob)) = line.split_once('\t') else {
    return Ok(None);
  };
  let probability: f64 = prob
    .trim()
    .parse()
    .map_err(|_| Error::input(format!("unparsable phrase probability {:?}", prob)))?;
  if !(probability > 0.0 && probability <= 1.0) {
    return Err(Error::probability(format!(
      "phrase {:?} has probability {} outside (0,1]",
      tags, probability
    )));
  }

  let mut slots = vec![];
  for tag in tags.split_whitespace() {
    let Some(dictionary) = by_tag.get(tag) else {
      warn!("skipping phrase {:?}: unknown tag {:?}", tags, tag);
      return Ok(None);
    };
    let Some(chain) = grammar.named_chain(dictionary) else {
      warn!("skipping phrase {:?}: no dictionary {:?}", tags, dictionary);
      return Ok(None);
    };
    slots.push(chain);
  }
  if slots.len() < min_slots {
    debug!("skipping phrase {:?}: {} slots, minimum is {}", tags, slots.len(), min_slots);
    return Ok(None);
  }
  Ok(Some(grammar.add_structure(slots, probability)))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::chains::Charsets;
  use crate::queue::GuessQueue;
  use crate::session::{Mode, Outcome, Session};
  use std::fs;
  use tempfile::TempDir;

  fn setup(min_slots: usize) -> (TempDir, PassphraseConfig) {
    let dir = TempDir::new().unwrap();
    let phrases = dir.path().join("Phrases");
    fs::create_dir_all(&phrases).unwrap();
    fs::write(
      dir.path().join("tagset.json"),
      r#"[
        {"tags": ["AT", "DT"], "dictionary": "determiners"},
        {"tags": ["NN", "NNS"], "dictionary": "nouns"},
        {"tags": ["VB", "VBD"], "dictionary": "verbs"}
      ]"#,
    )
    .unwrap();
    fs::write(phrases.join("determiners.txt"), "the\t0.6\na\t0.4\n").unwrap();
    fs::write(phrases.join("nouns.txt"), "dog\t0.5\ncat\t0.5\n").unwrap();
    fs::write(phrases.join("verbs.txt"), "ran\t1.0\n").unwrap();
    fs::write(
      phrases.join("Grammar.txt"),
      "AT NN VB AT NN\t0.7\nAT NN\t0.2\nXX NN VB AT NN\t0.1\n",
    )
    .unwrap();
    let config = PassphraseConfig {
      base_dir: dir.path().to_owned(),
      tagset: dir.path().join("tagset.json"),
      min_slots,
    };
    (dir, config)
  }

  #[test]
  fn tags_bind_to_named_dictionaries() {
    let (_dir, config) = setup(1);
    let g = load_passphrase_grammar(&config).unwrap();

    // the unknown-tag row is skipped, the two others survive
    assert_eq!(g.structures.len(), 2);
    assert_eq!(g.structures[0].slots.len(), 5);
    assert_eq!(g.structures[1].slots.len(), 2);
    assert_eq!(g.structures[0].slots[0], g.structures[0].slots[3]);
  }

  #[test]
  fn min_slots_filters_short_phrases() {
    let (_dir, config) = setup(DEFAULT_MIN_SLOTS);
    let g = load_passphrase_grammar(&config).unwrap();
    assert_eq!(g.structures.len(), 1);
    assert_eq!(g.structures[0].slots.len(), 5);
  }

  #[test]
  fn phrase_generation_descends_in_probability() {
    let (_dir, config) = setup(DEFAULT_MIN_SLOTS);
    let mut g = load_passphrase_grammar(&config).unwrap();
    g.build_seen_indices(&Charsets::default());

    let mut queue = GuessQueue::unbounded();
    queue.seed(&g);
    let mut session = Session::new(&g, queue, Vec::<u8>::new());
    let outcome = session.run(Mode::Generate).unwrap();
    assert_eq!(outcome, Outcome::Exhausted);

    let out = String::from_utf8(session.sink).unwrap();
    let lines: Vec<&str> = out.lines().collect();
    // 2 determiners x 2 nouns x 1 verb x 2 determiners x 2 nouns
    assert_eq!(lines.len(), 16);
    assert_eq!(lines[0], "thedogranthedog");
    assert!(lines.contains(&"acatranacat"));
  }
}
