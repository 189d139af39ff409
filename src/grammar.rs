
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::PathBuf;

use log::{debug, warn};

use crate::chains::{
  ChainId, Charsets, NodeRef, SymbolKind, TerminalChain, TerminalGroup, MAX_LEN,
};
use crate::dictionary::{load_word_chains, WordlistFilters, WordlistSpec};
use crate::errors::{Error, Result};
use crate::tables::load_kind_dir;

/// A learned grammar row: the resolved chain per slot plus the structure's
/// prior probability. An `L<n>` run contributes two slots (capitalization
/// then word); the other kinds contribute one.
#[derive(Clone, Debug)]
pub struct BaseStructure {
  pub slots: Vec<ChainId>,
  pub probability: f64,
}

/// The loaded grammar: immutable terminal chains, the per-(kind, length)
/// chain index, named chains for the passphrase taxonomy, base structures,
/// and the precomputed brute-force seen-index lists.
pub struct Grammar {
  pub chains: Vec<TerminalChain>,
  lookup: [[Option<ChainId>; MAX_LEN + 1]; 5],
  named: HashMap<String, ChainId>,
  pub structures: Vec<BaseStructure>,
  seen: Vec<Vec<u128>>,
}

impl Grammar {
  pub fn new() -> Grammar {
    Grammar {
      chains: vec![],
      lookup: [[None; MAX_LEN + 1]; 5],
      named: HashMap::new(),
      structures: vec![],
      seen: vec![],
    }
  }

  pub fn add_chain(&mut self, kind: SymbolKind, length: usize, mut chain: TerminalChain) -> ChainId {
    chain.assign_rainbow(kind, length as u8);
    let id = self.chains.len();
    self.chains.push(chain);
    self.seen.push(vec![]);
    self.lookup[kind.code() as usize][length] = Some(id);
    id
  }

  /// Registers a chain addressed by name rather than (kind, length); used by
  /// the part-of-speech taxonomy, whose dictionaries have no natural length.
  pub fn add_named_chain(&mut self, name: &str, mut chain: TerminalChain) -> ChainId {
    chain.assign_rainbow(SymbolKind::Word, 0);
    let id = self.chains.len();
    self.chains.push(chain);
    self.seen.push(vec![]);
    self.named.insert(name.to_owned(), id);
    id
  }

  pub fn chain(&self, id: ChainId) -> &TerminalChain {
    &self.chains[id]
  }

  pub fn group(&self, node: NodeRef) -> &TerminalGroup {
    &self.chains[node.chain].groups[node.index as usize]
  }

  pub fn chain_for(&self, kind: SymbolKind, length: usize) -> Option<ChainId> {
    if length > MAX_LEN {
      return None;
    }
    self.lookup[kind.code() as usize][length]
  }

  pub fn named_chain(&self, name: &str) -> Option<ChainId> {
    self.named.get(name).copied()
  }

  /// Resolves a rainbow triple back to a chain node. Rainbow indices are
  /// assigned in chain order, so the index doubles as the cursor.
  pub fn node_for_rainbow(&self, category: SymbolKind, length: usize, index: u16) -> Option<NodeRef> {
    let chain = self.chain_for(category, length)?;
    if (index as usize) < self.chains[chain].len() {
      Some(NodeRef { chain, index })
    } else {
      None
    }
  }

  pub fn add_structure(&mut self, slots: Vec<ChainId>, probability: f64) -> usize {
    self.structures.push(BaseStructure { slots, probability });
    self.structures.len() - 1
  }

  /// The joint probability of one choice of cursors for a structure: prior
  /// times the product of each slot's group probability.
  pub fn joint_probability(&self, structure: usize, cursors: &[u16]) -> f64 {
    let s = &self.structures[structure];
    let mut p = s.probability;
    for (slot, &cursor) in s.slots.iter().zip(cursors) {
      p *= self.chains[*slot].groups[cursor as usize].probability;
    }
    p
  }

  /// Parses and binds one base-structure row (`<run-sequence>\t<prob>`).
  /// Unresolvable rows are skipped with a warning; a probability outside
  /// (0,1] is fatal. Returns the structure index when the row was kept.
  pub fn bind_structure_row(&mut self, line: &str) -> Result<Option<usize>> {
    let line = line.strip_suffix('\r').unwrap_or(line);
    let Some((runs, prob)) = line.split_once('\t') else {
      if !line.is_empty() {
        debug!("skipping grammar line without a tab: {:?}", line);
      }
      return Ok(None);
    };
    let probability: f64 = prob
      .trim()
      .parse()
      .map_err(|_| Error::input(format!("unparsable structure probability {:?}", prob)))?;
    if !(probability > 0.0 && probability <= 1.0) {
      return Err(Error::probability(format!(
        "structure {:?} has probability {} outside (0,1]",
        runs, probability
      )));
    }

    let mut slots: Vec<ChainId> = vec![];
    for (letter, length) in group_runs(runs) {
      let Some(kind) = SymbolKind::from_run_letter(letter) else {
        warn!("skipping structure {:?}: unknown symbol {:?}", runs, letter);
        return Ok(None);
      };
      if length > MAX_LEN {
        warn!("skipping structure {:?}: run of {} exceeds {}", runs, length, MAX_LEN);
        return Ok(None);
      }
      if kind == SymbolKind::Word {
        // An alphabetic run binds the capitalization chain ahead of the
        // word chain so the materializer can apply case masks.
        let (Some(cap), Some(word)) = (
          self.chain_for(SymbolKind::Capitalization, length),
          self.chain_for(SymbolKind::Word, length),
        ) else {
          warn!("skipping structure {:?}: no terminals for L{}", runs, length);
          return Ok(None);
        };
        slots.push(cap);
        slots.push(word);
      } else {
        let Some(chain) = self.chain_for(kind, length) else {
          warn!("skipping structure {:?}: no terminals for {}{}", runs, letter, length);
          return Ok(None);
        };
        slots.push(chain);
      }
    }
    if slots.is_empty() {
      return Ok(None);
    }

    let idx = self.add_structure(slots, probability);
    let head = self.joint_probability(idx, &vec![0; self.structures[idx].slots.len()]);
    if head == 0.0 {
      return Err(Error::probability(format!(
        "structure {:?} has zero joint probability",
        runs
      )));
    }
    Ok(Some(idx))
  }

  pub fn load_structures<R: BufRead>(&mut self, reader: R) -> Result<usize> {
    let mut added = 0;
    for line in reader.lines() {
      let line = line?;
      if self.bind_structure_row(&line)?.is_some() {
        added += 1;
      }
    }
    Ok(added)
  }

  /// Precomputes, per digit and special chain, the sorted brute-force
  /// indices of every literal replacement, so brute expansion can skip
  /// strings the literal groups already emit.
  pub fn build_seen_indices(&mut self, charsets: &Charsets) {
    for (id, chain) in self.chains.iter().enumerate() {
      let kind = match chain.groups.first() {
        Some(g) => g.rainbow.category,
        None => continue,
      };
      let charset = match kind {
        SymbolKind::Digit => &charsets.digit,
        SymbolKind::Special => &charsets.special,
        _ => continue,
      };
      let mut indices: Vec<u128> = chain
        .groups
        .iter()
        .filter(|g| g.brute.is_none())
        .flat_map(|g| g.replacements.iter())
        .filter_map(|r| brute_index(r, charset))
        .collect();
      indices.sort_unstable();
      self.seen[id] = indices;
    }
  }

  pub fn seen(&self, chain: ChainId) -> &[u128] {
    &self.seen[chain]
  }
}

/// Groups consecutive equal letters of a run sequence: `"LLLDD"` yields
/// `[('L', 3), ('D', 2)]`.
pub fn group_runs(runs: &str) -> Vec<(char, usize)> {
  let mut out: Vec<(char, usize)> = vec![];
  for c in runs.chars() {
    match out.last_mut() {
      Some((letter, count)) if *letter == c => *count += 1,
      _ => out.push((c, 1)),
    }
  }
  out
}

/// The canonical brute-force index of a string over a charset, or None when
/// some character is outside the charset. Position i contributes
/// charset_position * |charset|^i.
pub fn brute_index(s: &str, charset: &str) -> Option<u128> {
  let k = charset.chars().count() as u128;
  let mut index: u128 = 0;
  let mut scale: u128 = 1;
  for c in s.chars() {
    let pos = charset.chars().position(|x| x == c)? as u128;
    index += pos * scale;
    scale *= k;
  }
  Some(index)
}

/// Where a ruleset's files live relative to the base directory.
#[derive(Clone, Debug)]
pub struct RulesConfig {
  pub base_dir: PathBuf,
  pub rule_name: String,
  pub wordlists: Vec<WordlistSpec>,
  pub filters: WordlistFilters,
}

impl RulesConfig {
  fn rules_dir(&self) -> PathBuf {
    self.base_dir.join("Rules").join(&self.rule_name)
  }
}

/// Loads a complete grammar: user wordlists, the four trained terminal
/// directories, and the base-structure file.
pub fn load_rules(config: &RulesConfig, charsets: &Charsets) -> Result<Grammar> {
  let mut grammar = Grammar::new();
  let rules = config.rules_dir();

  for (length, chain) in load_word_chains(&config.wordlists, &config.filters)?
    .into_iter()
    .enumerate()
  {
    if let Some(chain) = chain {
      grammar.add_chain(SymbolKind::Word, length, chain);
    }
  }
  for (dir, kind) in [
    ("Digits", SymbolKind::Digit),
    ("Special", SymbolKind::Special),
    ("Capitalization", SymbolKind::Capitalization),
    ("Keyboard", SymbolKind::Keyboard),
  ] {
    for (length, chain) in load_kind_dir(&rules.join(dir), kind)?.into_iter().enumerate() {
      if let Some(chain) = chain {
        grammar.add_chain(kind, length, chain);
      }
    }
  }

  let grammar_file = rules.join("Grammar").join("Grammar.txt");
  let file = File::open(&grammar_file).map_err(|e| {
    Error::input(format!("could not open grammar file {}: {}", grammar_file.display(), e))
  })?;
  let added = grammar.load_structures(BufReader::new(file))?;
  if added == 0 {
    return Err(Error::input(format!(
      "no usable base structures in {}",
      grammar_file.display()
    )));
  }

  grammar.build_seen_indices(charsets);
  Ok(grammar)
}
