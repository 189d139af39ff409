
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;

use float_ord::FloatOrd;
use lazy_static::lazy_static;
use log::warn;
use regex::Regex;

use crate::chains::{ChainBuilder, SymbolKind, TerminalChain, MAX_LEN, MAX_WORDLISTS};
use crate::errors::{Error, Result};

#[derive(Clone, Debug)]
pub struct WordlistSpec {
  pub path: PathBuf,
  pub prior: f64,
}

/// Which character classes are allowed to stay inside dictionary words.
/// Everything defaults to stripped; the grammar models case, digits and
/// specials with their own symbols.
#[derive(Clone, Copy, Debug, Default)]
pub struct WordlistFilters {
  pub keep_upper: bool,
  pub keep_special: bool,
  pub keep_digits: bool,
}

impl WordlistFilters {
  fn accepts(&self, word: &str) -> bool {
    lazy_static! {
      static ref UPPER_RE: Regex = Regex::new(r"[A-Z]").unwrap();
      static ref DIGIT_RE: Regex = Regex::new(r"[0-9]").unwrap();
      // ASCII that is neither a letter nor a digit; bytes above 0x7F pass
      static ref SPECIAL_RE: Regex = Regex::new(r"[[:ascii:]--[0-9A-Za-z]]").unwrap();
    }
    if !self.keep_upper && UPPER_RE.is_match(word) {
      return false;
    }
    if !self.keep_special && SPECIAL_RE.is_match(word) {
      return false;
    }
    if !self.keep_digits && DIGIT_RE.is_match(word) {
      return false;
    }
    true
  }
}

struct ScoredWord {
  word: String,
  length: usize,
  probability: f64,
}

/// Loads and merges the user wordlists into per-length word chains
/// (index = word length in characters; 0 and unseen lengths are None).
///
/// Priors are renormalized to sum to 1; each word then carries
/// prior(source) / count(same-length words from that source). A word found
/// in several lists keeps its single most probable copy.
pub fn load_word_chains(
  specs: &[WordlistSpec],
  filters: &WordlistFilters,
) -> Result<Vec<Option<TerminalChain>>> {
  if specs.is_empty() {
    return Err(Error::input("at least one wordlist is required"));
  }
  if specs.len() > MAX_WORDLISTS {
    return Err(Error::input(format!(
      "at most {} wordlists are supported, got {}",
      MAX_WORDLISTS,
      specs.len()
    )));
  }
  for spec in specs {
    if !(spec.prior > 0.0 && spec.prior <= 1.0) {
      return Err(Error::probability(format!(
        "wordlist {} has prior {} outside (0,1]",
        spec.path.display(),
        spec.prior
      )));
    }
  }

  let total: f64 = specs.iter().map(|s| s.prior).sum();
  let priors: Vec<f64> = specs.iter().map(|s| s.prior / total).collect();

  let mut counts = vec![[0usize; MAX_LEN + 1]; specs.len()];
  let mut raw: Vec<(String, usize, usize)> = vec![];

  for (source, spec) in specs.iter().enumerate() {
    let file = File::open(&spec.path).map_err(|e| {
      Error::input(format!("could not open wordlist {}: {}", spec.path.display(), e))
    })?;
    for line in BufReader::new(file).lines() {
      let line = line?;
      let word = line.strip_suffix('\r').unwrap_or(&line);
      let length = word.chars().count();
      if length == 0 || length > MAX_LEN {
        continue;
      }
      if !filters.accepts(word) {
        continue;
      }
      counts[source][length] += 1;
      raw.push((word.to_owned(), source, length));
    }
  }
  if raw.is_empty() {
    warn!("no usable words survived the wordlist filters");
  }

  let mut words: Vec<ScoredWord> = raw
    .into_iter()
    .map(|(word, source, length)| ScoredWord {
      word,
      length,
      probability: priors[source] / (counts[source][length] as f64),
    })
    .collect();

  // Keep the single most probable copy of each duplicated word.
  words.sort_by(|a, b| {
    a.word.cmp(&b.word).then(FloatOrd(b.probability).cmp(&FloatOrd(a.probability)))
  });
  words.dedup_by(|a, b| a.word == b.word);

  let mut chains: Vec<Option<TerminalChain>> = vec![None; MAX_LEN + 1];

  for length in 1..=MAX_LEN {
    // One candidate group per distinct per-source probability; sources that
    // work out to the same probability at this length share a group.
    let mut probs: Vec<f64> = (0..priors.len())
      .filter(|&s| counts[s][length] > 0)
      .map(|s| priors[s] / (counts[s][length] as f64))
      .collect();
    probs.sort_by(|a, b| FloatOrd(*b).cmp(&FloatOrd(*a)));
    probs.dedup();
    if probs.is_empty() {
      continue;
    }

    let mut builder = ChainBuilder::new(format!("word chain length {}", length));
    for p in &probs {
      for w in words.iter().filter(|w| w.length == length && w.probability == *p) {
        builder.push_row(w.word.clone(), *p)?;
      }
    }
    // A probability level can come up empty when deduplication moved all of
    // a source's words of this length into a higher-probability level.
    if builder.is_empty() {
      continue;
    }
    let chain = builder.finish(SymbolKind::Word, length);
    chain.validate()?;
    chains[length] = Some(chain);
  }

  Ok(chains)
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Write;
  use tempfile::NamedTempFile;

  fn wordlist(lines: &[&str]) -> NamedTempFile {
    let mut f = NamedTempFile::new().unwrap();
    for l in lines {
      writeln!(f, "{}", l).unwrap();
    }
    f.flush().unwrap();
    f
  }

  #[test]
  fn per_length_probability_and_merge() {
    let a = wordlist(&["cat", "dog", "mouse"]);
    let b = wordlist(&["cat", "owl"]);
    let specs = vec![
      WordlistSpec { path: a.path().to_owned(), prior: 0.6 },
      WordlistSpec { path: b.path().to_owned(), prior: 0.4 },
    ];
    let chains = load_word_chains(&specs, &WordlistFilters::default()).unwrap();

    // At length 3, list a holds cat/dog and list b holds cat/owl.
    // a's share is 0.6/2 = 0.3, b's is 0.4/2 = 0.2; "cat" keeps the 0.3 copy.
    let chain = chains[3].as_ref().unwrap();
    assert_eq!(chain.groups.len(), 2);
    assert_eq!(chain.groups[0].probability, 0.3);
    assert_eq!(chain.groups[0].replacements, vec!["cat", "dog"]);
    assert_eq!(chain.groups[1].probability, 0.2);
    assert_eq!(chain.groups[1].replacements, vec!["owl"]);

    let chain5 = chains[5].as_ref().unwrap();
    assert_eq!(chain5.groups.len(), 1);
    assert_eq!(chain5.groups[0].probability, 0.6);
    assert_eq!(chain5.groups[0].replacements, vec!["mouse"]);

    assert!(chains[4].is_none());
  }

  #[test]
  fn priors_are_renormalized() {
    let a = wordlist(&["one"]);
    let b = wordlist(&["two", "six"]);
    let specs = vec![
      WordlistSpec { path: a.path().to_owned(), prior: 0.5 },
      WordlistSpec { path: b.path().to_owned(), prior: 0.25 },
    ];
    let chains = load_word_chains(&specs, &WordlistFilters::default()).unwrap();
    let chain = chains[3].as_ref().unwrap();

    // Renormalized priors are 2/3 and 1/3.
    assert!((chain.groups[0].probability - 2.0 / 3.0).abs() < 1e-12);
    assert!((chain.groups[1].probability - 1.0 / 6.0).abs() < 1e-12);
  }

  #[test]
  fn filters_strip_cased_and_decorated_words() {
    let a = wordlist(&["plain", "Upper", "pass1", "pa$s", "ok"]);
    let specs = vec![WordlistSpec { path: a.path().to_owned(), prior: 1.0 }];

    let chains = load_word_chains(&specs, &WordlistFilters::default()).unwrap();
    let all: Vec<String> = chains
      .iter()
      .flatten()
      .flat_map(|c| c.groups.iter())
      .flat_map(|g| g.replacements.iter().cloned())
      .collect();
    assert_eq!(all, vec!["ok", "plain"]);

    let keep = WordlistFilters { keep_upper: true, keep_special: true, keep_digits: true };
    let chains = load_word_chains(&specs, &keep).unwrap();
    let all: Vec<String> = chains
      .iter()
      .flatten()
      .flat_map(|c| c.groups.iter())
      .flat_map(|g| g.replacements.iter().cloned())
      .collect();
    assert_eq!(all.len(), 5);
  }

  #[test]
  fn carriage_returns_are_stripped() {
    let a = wordlist(&["word\r"]);
    let specs = vec![WordlistSpec { path: a.path().to_owned(), prior: 1.0 }];
    let chains = load_word_chains(&specs, &WordlistFilters::default()).unwrap();
    assert_eq!(chains[4].as_ref().unwrap().groups[0].replacements, vec!["word"]);
  }

  #[test]
  fn overlong_words_are_dropped() {
    let long = "a".repeat(19);
    let a = wordlist(&[long.as_str(), "short"]);
    let specs = vec![WordlistSpec { path: a.path().to_owned(), prior: 1.0 }];
    let chains = load_word_chains(&specs, &WordlistFilters::default()).unwrap();
    assert!(chains.iter().skip(6).all(|c| c.is_none()));
    assert!(chains[5].is_some());
  }

  #[test]
  fn bad_prior_is_rejected() {
    let a = wordlist(&["word"]);
    let specs = vec![WordlistSpec { path: a.path().to_owned(), prior: 0.0 }];
    assert!(matches!(
      load_word_chains(&specs, &WordlistFilters::default()),
      Err(Error::ProbabilityViolation(_))
    ));
  }
}
