
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::warn;

use crate::chains::Charsets;
use crate::errors::{Error, Result};
use crate::grammar::Grammar;
use crate::materialize;
use crate::precompute;
use crate::queue::GuessQueue;
use crate::recovery::RecoveryFile;

/// How many popped pre-terminals between checkpoint rewrites.
pub const CHECKPOINT_EVERY: u64 = 100;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Mode {
  /// Expand every popped pre-terminal to guesses on the sink.
  Generate,
  /// Only accumulate how many guesses would be emitted.
  CountOnly,
  /// Serialize popped pre-terminals as precompute records on the sink.
  Precompute,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Outcome {
  /// The queue reached its terminal state: the whole DAG was enumerated.
  Exhausted,
  /// The configured pre-terminal cap was hit.
  CapReached,
  /// The cooperative stop flag was observed.
  Stopped,
}

/// A between-pops snapshot for status reporting. Readers must not touch
/// queue state; everything they may want is copied out here.
#[derive(Clone, Copy, Debug)]
pub struct Status {
  pub preterminals: u64,
  pub guesses: u128,
  pub queue_len: usize,
  pub floor: f64,
  pub probability: f64,
}

/// Carries everything the generation loop touches, so nothing lives in
/// process globals: the grammar, the queue, the output sink, the optional
/// checkpointer, and the collaboration hooks.
pub struct Session<'g, W: Write> {
  pub grammar: &'g Grammar,
  pub queue: GuessQueue,
  pub charsets: Charsets,
  pub sink: W,
  pub checkpoint: Option<RecoveryFile>,
  pub max_preterminals: Option<u64>,
  pub stop: Arc<AtomicBool>,
  pub status: Option<Box<dyn FnMut(&Status) + 'g>>,
}

impl<'g, W: Write> Session<'g, W> {
  pub fn new(grammar: &'g Grammar, queue: GuessQueue, sink: W) -> Session<'g, W> {
    Session {
      grammar,
      queue,
      charsets: Charsets::default(),
      sink,
      checkpoint: None,
      max_preterminals: None,
      stop: Arc::new(AtomicBool::new(false)),
      status: None,
    }
  }

  pub fn stop_flag(&self) -> Arc<AtomicBool> {
    self.stop.clone()
  }

  /// Drives pop, expand, deadbeat descent, and rebuild-on-empty until the
  /// queue is exhausted, the pre-terminal cap is hit, or a stop is
  /// requested. Sink errors are fatal; checkpoint errors are logged and the
  /// loop continues.
  pub fn run(&mut self, mode: Mode) -> Result<Outcome> {
    let mut pops: u64 = 0;
    let mut guesses: u128 = 0;
    let mut last_probability: Option<f64> = None;

    loop {
      let Some((pt, probability)) = self.queue.pop() else {
        let max_probability = self.queue.floor();
        self.queue.rebuild(self.grammar, max_probability);
        if self.queue.is_empty() {
          self.sink.flush()?;
          if let Some(p) = last_probability {
            self.write_checkpoint(p);
          }
          return Ok(Outcome::Exhausted);
        }
        continue;
      };
      if probability < self.queue.floor() {
        return Err(Error::probability(format!(
          "popped pre-terminal at {} below the floor {}",
          probability,
          self.queue.floor()
        )));
      }
      pops += 1;
      last_probability = Some(probability);

      let slots = pt.resolve(self.grammar);
      match mode {
        Mode::Generate => {
          guesses += materialize::emit(self.grammar, &self.charsets, &slots, &mut self.sink)? as u128;
        }
        Mode::CountOnly => {
          guesses += materialize::count(self.grammar, &self.charsets, &slots);
        }
        Mode::Precompute => {
          precompute::write_record(&mut self.sink, self.grammar, &slots)?;
        }
      }

      self.queue.push_children(self.grammar, &pt, probability);

      if pops % CHECKPOINT_EVERY == 0 {
        self.write_checkpoint(probability);
      }
      if let Some(callback) = &mut self.status {
        callback(&Status {
          preterminals: pops,
          guesses,
          queue_len: self.queue.len(),
          floor: self.queue.floor(),
          probability,
        });
      }

      if self.max_preterminals.map_or(false, |cap| pops >= cap) {
        self.sink.flush()?;
        self.write_checkpoint(probability);
        return Ok(Outcome::CapReached);
      }
      if self.stop.load(Ordering::Relaxed) {
        self.sink.flush()?;
        self.write_checkpoint(probability);
        return Ok(Outcome::Stopped);
      }
    }
  }

  fn write_checkpoint(&mut self, probability: f64) {
    if let Some(recovery) = &mut self.checkpoint {
      if let Err(e) = recovery.update(probability) {
        warn!("checkpoint write failed: {}", e);
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::chains::{ChainBuilder, ReplaceRule, SymbolKind, TerminalChain};
  use crate::queue::GuessQueue;
  use std::cell::Cell;
  use std::rc::Rc;

  fn chain(kind: SymbolKind, length: usize, rows: &[(&str, f64)]) -> TerminalChain {
    let mut b = ChainBuilder::new("test");
    for (r, p) in rows {
      b.push_row((*r).to_owned(), *p).unwrap();
    }
    b.finish(kind, length)
  }

  fn run_collect(grammar: &Grammar, mode: Mode) -> (String, Outcome) {
    let mut queue = GuessQueue::unbounded();
    queue.seed(grammar);
    let mut session = Session::new(grammar, queue, Vec::<u8>::new());
    let outcome = session.run(mode).unwrap();
    (String::from_utf8(session.sink).unwrap(), outcome)
  }

  #[test]
  fn single_digit_structure_in_probability_order() {
    // one base structure, a two-group digit chain: 1 then 2,3
    let mut g = Grammar::new();
    let d = g.add_chain(SymbolKind::Digit, 1, chain(SymbolKind::Digit, 1, &[("1", 0.6), ("2", 0.2), ("3", 0.2)]));
    g.add_structure(vec![d], 1.0);

    let (out, outcome) = run_collect(&g, Mode::Generate);
    assert_eq!(out, "1\n2\n3\n");
    assert_eq!(outcome, Outcome::Exhausted);
  }

  #[test]
  fn structures_interleave_by_joint_probability() {
    let mut g = Grammar::new();
    let mut cap = chain(SymbolKind::Capitalization, 1, &[("L", 1.0)]);
    cap.groups[0].rule = ReplaceRule::Lowercase;
    let cap1 = g.add_chain(SymbolKind::Capitalization, 1, cap);
    let w1 = g.add_chain(SymbolKind::Word, 1, chain(SymbolKind::Word, 1, &[("a", 1.0)]));
    let d1 = g.add_chain(SymbolKind::Digit, 1, chain(SymbolKind::Digit, 1, &[("1", 1.0)]));
    g.add_structure(vec![cap1, w1, d1], 0.6);
    g.add_structure(vec![d1], 0.4);

    let (out, _) = run_collect(&g, Mode::Generate);
    assert_eq!(out, "a1\n1\n");
  }

  #[test]
  fn capitalization_masks_follow_the_lowercase_group() {
    let mut g = Grammar::new();
    let mut cap = chain(SymbolKind::Capitalization, 2, &[("LL", 0.7), ("UL", 0.3), ("LU", 0.3)]);
    cap.groups[0].rule = ReplaceRule::Lowercase;
    cap.groups[1].rule = ReplaceRule::Mask;
    let cap2 = g.add_chain(SymbolKind::Capitalization, 2, cap);
    let w2 = g.add_chain(SymbolKind::Word, 2, chain(SymbolKind::Word, 2, &[("ab", 1.0)]));
    let d1 = g.add_chain(SymbolKind::Digit, 1, chain(SymbolKind::Digit, 1, &[("1", 1.0)]));
    g.add_structure(vec![cap2, w2, d1], 1.0);

    let (out, _) = run_collect(&g, Mode::Generate);
    assert_eq!(out, "ab1\nAb1\naB1\n");
  }

  #[test]
  fn count_only_accumulates_without_emitting() {
    let mut g = Grammar::new();
    let d = g.add_chain(SymbolKind::Digit, 1, chain(SymbolKind::Digit, 1, &[("1", 0.6), ("2", 0.2), ("3", 0.2)]));
    g.add_structure(vec![d], 1.0);

    let counted = Rc::new(Cell::new(0u128));
    let mut queue = GuessQueue::unbounded();
    queue.seed(&g);
    let mut session = Session::new(&g, queue, Vec::<u8>::new());
    let counted_in = counted.clone();
    session.status = Some(Box::new(move |s: &Status| counted_in.set(s.guesses)));
    session.run(Mode::CountOnly).unwrap();

    assert_eq!(counted.get(), 3);
    assert!(session.sink.is_empty());
  }

  #[test]
  fn pre_terminal_cap_short_circuits() {
    let mut g = Grammar::new();
    let d = g.add_chain(SymbolKind::Digit, 1, chain(SymbolKind::Digit, 1, &[("1", 0.6), ("2", 0.2)]));
    g.add_structure(vec![d], 1.0);

    let mut queue = GuessQueue::unbounded();
    queue.seed(&g);
    let mut session = Session::new(&g, queue, Vec::<u8>::new());
    session.max_preterminals = Some(1);
    let outcome = session.run(Mode::Generate).unwrap();

    assert_eq!(outcome, Outcome::CapReached);
    assert_eq!(String::from_utf8(session.sink.clone()).unwrap(), "1\n");
  }

  #[test]
  fn stop_flag_finishes_the_current_pre_terminal() {
    let mut g = Grammar::new();
    let d = g.add_chain(SymbolKind::Digit, 1, chain(SymbolKind::Digit, 1, &[("1", 0.6), ("2", 0.2)]));
    g.add_structure(vec![d], 1.0);

    let mut queue = GuessQueue::unbounded();
    queue.seed(&g);
    let mut session = Session::new(&g, queue, Vec::<u8>::new());
    session.stop.store(true, Ordering::Relaxed);
    let outcome = session.run(Mode::Generate).unwrap();

    // the flag was already set, so exactly one pre-terminal is completed
    assert_eq!(outcome, Outcome::Stopped);
    assert_eq!(String::from_utf8(session.sink.clone()).unwrap(), "1\n");
  }

  #[test]
  fn checkpoint_records_progress() {
    use crate::recovery::{RecoveryConfig, RecoveryFile};
    use tempfile::TempDir;

    let mut g = Grammar::new();
    let d = g.add_chain(SymbolKind::Digit, 1, chain(SymbolKind::Digit, 1, &[("1", 0.6), ("2", 0.2)]));
    g.add_structure(vec![d], 1.0);

    let dir = TempDir::new().unwrap();
    let path = dir.path().join("save.rec");
    let config = RecoveryConfig {
      rules: "Default".to_owned(),
      keep_upper: false,
      keep_special: false,
      keep_digits: false,
      precompute_mode: 0,
      wordlists: vec![("w.txt".to_owned(), 1.0)],
    };

    let mut queue = GuessQueue::unbounded();
    queue.seed(&g);
    let mut session = Session::new(&g, queue, Vec::<u8>::new());
    session.checkpoint = Some(RecoveryFile::create(&path, &config, 1.0).unwrap());
    session.run(Mode::Generate).unwrap();
    drop(session);

    let (_, restore_point) = RecoveryFile::load(&path).unwrap();
    assert!((restore_point - 0.2).abs() < 1e-12);
  }
}
