
use crate::errors::{Error, Result};

/// Maximum length of a terminal replacement (and of a single symbol run).
pub const MAX_LEN: usize = 18;

/// Maximum number of user wordlists that can be merged into the word chains.
pub const MAX_WORDLISTS: usize = 10;

/// Symbol taxonomy. The numeric codes double as the rainbow category on the
/// precompute wire format, so they must stay stable.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum SymbolKind {
  Capitalization,
  Digit,
  Special,
  Word,
  Keyboard,
}

pub const SYMBOL_KINDS: [SymbolKind; 5] = [
  SymbolKind::Capitalization,
  SymbolKind::Digit,
  SymbolKind::Special,
  SymbolKind::Word,
  SymbolKind::Keyboard,
];

impl SymbolKind {
  pub fn code(&self) -> u8 {
    match self {
      SymbolKind::Capitalization => 0,
      SymbolKind::Digit => 1,
      SymbolKind::Special => 2,
      SymbolKind::Word => 3,
      SymbolKind::Keyboard => 4,
    }
  }

  pub fn from_code(code: u8) -> Option<SymbolKind> {
    SYMBOL_KINDS.get(code as usize).copied()
  }

  /// The letter used for this kind in a base-structure run sequence.
  /// Word runs are written `L` and implicitly drag in a capitalization slot,
  /// so `Capitalization` has no letter of its own.
  pub fn from_run_letter(letter: char) -> Option<SymbolKind> {
    match letter {
      'L' => Some(SymbolKind::Word),
      'D' => Some(SymbolKind::Digit),
      'S' => Some(SymbolKind::Special),
      'K' => Some(SymbolKind::Keyboard),
      _ => None,
    }
  }
}

/// How a group's replacements are applied when materializing a guess.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ReplaceRule {
  /// Append the replacement as-is.
  Literal,
  /// The replacement is a mask over {L,U} applied to the following word slot.
  Mask,
  /// A single all-`L` mask; the following word slot passes through unchanged.
  Lowercase,
}

impl ReplaceRule {
  pub fn code(&self) -> u8 {
    match self {
      ReplaceRule::Literal => 0,
      ReplaceRule::Mask => 1,
      ReplaceRule::Lowercase => 2,
    }
  }

  pub fn from_code(code: u8) -> Option<ReplaceRule> {
    match code {
      0 => Some(ReplaceRule::Literal),
      1 => Some(ReplaceRule::Mask),
      2 => Some(ReplaceRule::Lowercase),
      _ => None,
    }
  }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CharsetKind {
  Alpha,
  Digit,
  Special,
}

impl CharsetKind {
  pub fn for_symbol(kind: SymbolKind) -> CharsetKind {
    match kind {
      SymbolKind::Digit => CharsetKind::Digit,
      SymbolKind::Special => CharsetKind::Special,
      _ => CharsetKind::Alpha,
    }
  }
}

/// The brute-force alphabets. The exact strings (character order included)
/// are load-bearing: brute-force enumeration order and the precomputed
/// seen-index lists both depend on character positions.
#[derive(Clone, Debug)]
pub struct Charsets {
  pub alpha: String,
  pub digit: String,
  pub special: String,
}

impl Default for Charsets {
  fn default() -> Charsets {
    Charsets {
      alpha: "aeoirlnstmcudbpghyvfkjzxwq".to_owned(),
      digit: "0l29837654".to_owned(),
      special: "!._-*@/+,\\$&!=?'#\")(%^<> ;".to_owned(),
    }
  }
}

impl Charsets {
  pub fn get(&self, kind: CharsetKind) -> &str {
    match kind {
      CharsetKind::Alpha => &self.alpha,
      CharsetKind::Digit => &self.digit,
      CharsetKind::Special => &self.special,
    }
  }
}

/// Identifies a chain node for binary serialization.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Rainbow {
  pub category: SymbolKind,
  pub length: u8,
  pub index: u16,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct BruteForce {
  pub charset: CharsetKind,
  pub length: u8,
}

/// One equal-probability group of replacements for a symbol of a given
/// length.
#[derive(Clone, Debug)]
pub struct TerminalGroup {
  pub replacements: Vec<String>,
  pub probability: f64,
  pub rule: ReplaceRule,
  pub brute: Option<BruteForce>,
  pub rainbow: Rainbow,
}

/// A probability-descending sequence of replacement groups. Chains are
/// immutable after load; prev/next navigation is index arithmetic.
#[derive(Clone, Debug, Default)]
pub struct TerminalChain {
  pub groups: Vec<TerminalGroup>,
}

pub type ChainId = usize;

/// A pointer into a chain. Pre-terminals hold these instead of references,
/// which keeps the chains free of aliasing lifetimes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct NodeRef {
  pub chain: ChainId,
  pub index: u16,
}

impl TerminalChain {
  pub fn len(&self) -> usize {
    self.groups.len()
  }

  pub fn is_empty(&self) -> bool {
    self.groups.is_empty()
  }

  pub fn next(&self, index: u16) -> Option<u16> {
    if (index as usize) + 1 < self.groups.len() { Some(index + 1) } else { None }
  }

  pub fn prev(&self, index: u16) -> Option<u16> {
    if index > 0 { Some(index - 1) } else { None }
  }

  /// Stamps the rainbow triple onto every group, in chain order.
  pub fn assign_rainbow(&mut self, category: SymbolKind, length: u8) {
    for (i, group) in self.groups.iter_mut().enumerate() {
      group.rainbow = Rainbow { category, length, index: i as u16 };
    }
  }

  /// Checks the chain ordering invariant: walking forward yields strictly
  /// decreasing probabilities (group boundaries coincide with probability
  /// changes).
  pub fn validate(&self) -> Result<()> {
    for pair in self.groups.windows(2) {
      if pair[1].probability >= pair[0].probability {
        return Err(Error::probability(format!(
          "chain out of order: {} follows {}",
          pair[1].probability, pair[0].probability
        )));
      }
    }
    Ok(())
  }
}

/// Builds a chain from `(replacement, probability)` rows in file order.
/// Consecutive rows with equal probability land in one group; a probability
/// change starts the next group. Rows must arrive in non-increasing order.
pub struct ChainBuilder {
  groups: Vec<TerminalGroup>,
  context: String,
}

impl ChainBuilder {
  pub fn new(context: impl Into<String>) -> ChainBuilder {
    ChainBuilder { groups: vec![], context: context.into() }
  }

  pub fn push_row(&mut self, replacement: String, probability: f64) -> Result<()> {
    if !(probability > 0.0 && probability <= 1.0) {
      return Err(Error::probability(format!(
        "{}: probability {} for {:?} outside (0,1]",
        self.context, probability, replacement
      )));
    }
    match self.groups.last_mut() {
      Some(last) if last.probability == probability => {
        last.replacements.push(replacement);
      }
      Some(last) if last.probability < probability => {
        return Err(Error::input(format!(
          "{}: rows not sorted by descending probability ({} after {})",
          self.context, probability, last.probability
        )));
      }
      _ => {
        self.groups.push(TerminalGroup {
          replacements: vec![replacement],
          probability,
          rule: ReplaceRule::Literal,
          brute: None,
          rainbow: Rainbow { category: SymbolKind::Word, length: 0, index: 0 },
        });
      }
    }
    Ok(())
  }

  /// Appends a brute-force smoothing group at the tail of the chain. Its
  /// single replacement is a sentinel of the required length.
  pub fn push_brute(&mut self, charset: CharsetKind, length: usize, probability: f64) -> Result<()> {
    if !(probability > 0.0 && probability <= 1.0) {
      return Err(Error::probability(format!(
        "{}: smoothing probability {} outside (0,1]",
        self.context, probability
      )));
    }
    if let Some(last) = self.groups.last() {
      if probability >= last.probability {
        return Err(Error::input(format!(
          "{}: smoothing probability {} does not descend below the chain tail {}",
          self.context, probability, last.probability
        )));
      }
    }
    self.groups.push(TerminalGroup {
      replacements: vec!["0".repeat(length)],
      probability,
      rule: ReplaceRule::Literal,
      brute: Some(BruteForce { charset, length: length as u8 }),
      rainbow: Rainbow { category: SymbolKind::Word, length: 0, index: 0 },
    });
    Ok(())
  }

  pub fn is_empty(&self) -> bool {
    self.groups.is_empty()
  }

  pub fn finish(self, category: SymbolKind, length: usize) -> TerminalChain {
    let mut chain = TerminalChain { groups: self.groups };
    chain.assign_rainbow(category, length as u8);
    chain
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn builder_groups_by_probability_change() {
    let mut b = ChainBuilder::new("test");
    b.push_row("123".to_owned(), 0.5).unwrap();
    b.push_row("777".to_owned(), 0.5).unwrap();
    b.push_row("000".to_owned(), 0.2).unwrap();
    let chain = b.finish(SymbolKind::Digit, 3);

    assert_eq!(chain.len(), 2);
    assert_eq!(chain.groups[0].replacements, vec!["123", "777"]);
    assert_eq!(chain.groups[1].replacements, vec!["000"]);
    chain.validate().unwrap();
  }

  #[test]
  fn builder_rejects_ascending_rows() {
    let mut b = ChainBuilder::new("test");
    b.push_row("1".to_owned(), 0.2).unwrap();
    assert!(matches!(b.push_row("2".to_owned(), 0.5), Err(Error::InputFormat(_))));
  }

  #[test]
  fn builder_rejects_bad_probability() {
    let mut b = ChainBuilder::new("test");
    assert!(matches!(b.push_row("1".to_owned(), 0.0), Err(Error::ProbabilityViolation(_))));
    assert!(matches!(b.push_row("1".to_owned(), 1.5), Err(Error::ProbabilityViolation(_))));
  }

  #[test]
  fn rainbow_indices_follow_chain_order() {
    let mut b = ChainBuilder::new("test");
    b.push_row("1".to_owned(), 0.6).unwrap();
    b.push_row("2".to_owned(), 0.3).unwrap();
    b.push_brute(CharsetKind::Digit, 1, 0.1).unwrap();
    let chain = b.finish(SymbolKind::Digit, 1);

    for (i, group) in chain.groups.iter().enumerate() {
      assert_eq!(group.rainbow.index, i as u16);
      assert_eq!(group.rainbow.category, SymbolKind::Digit);
      assert_eq!(group.rainbow.length, 1);
    }
    assert_eq!(chain.groups[2].replacements, vec!["0"]);
    assert!(chain.groups[2].brute.is_some());
  }

  #[test]
  fn chain_navigation() {
    let mut b = ChainBuilder::new("test");
    b.push_row("1".to_owned(), 0.6).unwrap();
    b.push_row("2".to_owned(), 0.3).unwrap();
    let chain = b.finish(SymbolKind::Digit, 1);

    assert_eq!(chain.next(0), Some(1));
    assert_eq!(chain.next(1), None);
    assert_eq!(chain.prev(0), None);
    assert_eq!(chain.prev(1), Some(0));
  }
}
