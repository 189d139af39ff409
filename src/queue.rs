
use float_ord::FloatOrd;
use keyed_priority_queue::KeyedPriorityQueue;

use crate::chains::NodeRef;
use crate::grammar::Grammar;

/// One choice of chain node per slot of a base structure. The cursors index
/// into each slot's chain; the joint probability is always recomputed from
/// the grammar rather than cached here, so the tuple itself can serve as the
/// queue key.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct PreTerminal {
  pub structure: usize,
  pub cursors: Vec<u16>,
}

impl PreTerminal {
  pub fn seed(structure: usize, arity: usize) -> PreTerminal {
    PreTerminal { structure, cursors: vec![0; arity] }
  }

  pub fn probability(&self, grammar: &Grammar) -> f64 {
    grammar.joint_probability(self.structure, &self.cursors)
  }

  pub fn resolve(&self, grammar: &Grammar) -> Vec<NodeRef> {
    grammar.structures[self.structure]
      .slots
      .iter()
      .zip(&self.cursors)
      .map(|(chain, cursor)| NodeRef { chain: *chain, index: *cursor })
      .collect()
  }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum QueueState {
  Seeded,
  Draining,
  Rebuilding,
  Exhausted,
}

/// Max-heap of pre-terminals ordered by joint probability, with a bounded
/// size. Two keyed queues are kept in lockstep: `by_high` pops the best item,
/// `by_low` (which stores negated probabilities) lets trim discard from the
/// bottom without draining everything.
pub struct GuessQueue {
  by_high: KeyedPriorityQueue<PreTerminal, FloatOrd<f64>>,
  by_low: KeyedPriorityQueue<PreTerminal, FloatOrd<f64>>,
  cap: usize,
  floor: f64,
  state: QueueState,
}

struct Frame {
  cursor: u16,
  first: bool,
  prefix: f64,
}

impl GuessQueue {
  pub fn new(cap: usize) -> GuessQueue {
    GuessQueue {
      by_high: KeyedPriorityQueue::new(),
      by_low: KeyedPriorityQueue::new(),
      cap,
      floor: 0.0,
      state: QueueState::Seeded,
    }
  }

  pub fn unbounded() -> GuessQueue {
    GuessQueue::new(usize::MAX)
  }

  pub fn len(&self) -> usize {
    self.by_high.len()
  }

  pub fn is_empty(&self) -> bool {
    self.by_high.is_empty()
  }

  pub fn floor(&self) -> f64 {
    self.floor
  }

  pub fn state(&self) -> QueueState {
    self.state
  }

  pub fn clear(&mut self) {
    self.by_high = KeyedPriorityQueue::new();
    self.by_low = KeyedPriorityQueue::new();
  }

  /// Pushes every base structure's head pre-terminal whose joint probability
  /// clears the floor.
  pub fn seed(&mut self, grammar: &Grammar) {
    for (i, s) in grammar.structures.iter().enumerate() {
      let pt = PreTerminal::seed(i, s.slots.len());
      let p = pt.probability(grammar);
      self.push(pt, p);
    }
  }

  /// Inserts a pre-terminal unless it falls below the floor. Exceeding the
  /// cap triggers a trim, which may raise the floor.
  pub fn push(&mut self, pt: PreTerminal, probability: f64) -> bool {
    if probability < self.floor {
      return false;
    }
    self.by_high.push(pt.clone(), FloatOrd(probability));
    self.by_low.push(pt, FloatOrd(-probability));
    if self.by_high.len() >= self.cap {
      self.trim();
    }
    true
  }

  pub fn pop(&mut self) -> Option<(PreTerminal, f64)> {
    let (pt, FloatOrd(p)) = self.by_high.pop()?;
    self.by_low.remove(&pt);
    self.state = QueueState::Draining;
    Some((pt, p))
  }

  pub fn peek_probability(&self) -> Option<f64> {
    self.by_high.peek().map(|(_, FloatOrd(p))| *p)
  }

  /// Retains the top half of the queue. The probability of the best
  /// discarded item becomes the new floor; items tied with the worst
  /// retained item are all retained, so no tie is split across the boundary.
  fn trim(&mut self) {
    let target = self.cap / 2;
    let mut discarded: Vec<(PreTerminal, f64)> = vec![];
    while self.by_low.len() > target {
      let (pt, FloatOrd(neg)) = self.by_low.pop().expect("queues out of sync");
      self.by_high.remove(&pt);
      discarded.push((pt, -neg));
    }
    // discarded is in ascending probability order
    let boundary = self.by_low.peek().map(|(_, FloatOrd(neg))| -*neg);
    if let Some(boundary) = boundary {
      while discarded.last().map_or(false, |(_, p)| *p == boundary) {
        let (pt, p) = discarded.pop().expect("just checked");
        self.by_high.push(pt.clone(), FloatOrd(p));
        self.by_low.push(pt, FloatOrd(-p));
      }
    }
    if let Some((_, first_discarded)) = discarded.last() {
      self.floor = *first_discarded;
    }
  }

  /// The deadbeat-dad generator: for each slot of the popped parent with a
  /// successor, insert the advanced child only when this parent is the
  /// child's designated parent, so every reachable pre-terminal enters the
  /// queue exactly once.
  pub fn push_children(&mut self, grammar: &Grammar, parent: &PreTerminal, parent_probability: f64) {
    let arity = grammar.structures[parent.structure].slots.len();
    for i in 0..arity {
      let slot = grammar.structures[parent.structure].slots[i];
      let Some(next) = grammar.chain(slot).next(parent.cursors[i]) else { continue };
      let mut cursors = parent.cursors.clone();
      cursors[i] = next;
      let child = PreTerminal { structure: parent.structure, cursors };
      let p = child.probability(grammar);
      if p >= self.floor && is_designated_parent(grammar, &child, i, parent_probability) {
        self.push(child, p);
      }
    }
  }

  /// Repopulates an empty (or restored) queue with every pre-terminal whose
  /// probability lies in the window (floor, max_probability] and whose
  /// parents were all consumed before the window opened. The floor drops to
  /// zero on entry; trims during the walk may raise it again.
  pub fn rebuild(&mut self, grammar: &Grammar, max_probability: f64) {
    self.state = QueueState::Rebuilding;
    self.clear();
    self.floor = 0.0;
    for si in 0..grammar.structures.len() {
      self.rebuild_structure(grammar, si, max_probability);
    }
    self.state = if self.is_empty() { QueueState::Exhausted } else { QueueState::Draining };
  }

  /// Walks one structure's cursor space depth-first with an explicit stack,
  /// left slot outermost. Chains are probability-sorted, so at the deepest
  /// slot the walk skips cursors still above the window and stops at the
  /// first one inside it: anything further down is reachable from that
  /// frontier item by deadbeat descent. A level whose very first combination
  /// already terminated the walk tells its parent level to stop too.
  fn rebuild_structure(&mut self, grammar: &Grammar, si: usize, max_probability: f64) {
    let arity = grammar.structures[si].slots.len();
    let base = grammar.structures[si].probability;
    let chain_at = |pos: usize| grammar.chain(grammar.structures[si].slots[pos]);

    let mut cursors: Vec<u16> = vec![0; arity];
    let mut frames: Vec<Frame> = vec![Frame { cursor: 0, first: true, prefix: base }];
    let mut pending: Option<bool> = None;

    loop {
      if let Some(stop) = pending.take() {
        if stop {
          // the level below never advanced: lower cursors here are pointless
          let Some(frame) = frames.pop() else { break };
          if frames.is_empty() {
            break;
          }
          pending = Some(frame.first);
          continue;
        }
        let pos = frames.len() - 1;
        let chain_len = chain_at(pos).len();
        let frame = frames.last_mut().expect("frame stack never empty here");
        frame.cursor += 1;
        if (frame.cursor as usize) < chain_len {
          frame.first = false;
        }
      }

      let pos = frames.len() - 1;
      let chain = chain_at(pos);
      let (cursor, first, prefix) = {
        let f = frames.last().expect("frame stack never empty here");
        (f.cursor, f.first, f.prefix)
      };

      if (cursor as usize) >= chain.len() {
        frames.pop();
        if frames.is_empty() {
          break;
        }
        pending = Some(first);
        continue;
      }

      cursors[pos] = cursor;
      let cur = prefix * chain.groups[cursor as usize].probability;

      if pos + 1 < arity {
        frames.push(Frame { cursor: 0, first: true, prefix: cur });
        continue;
      }

      // deepest slot
      if cur < self.floor {
        frames.pop();
        if frames.is_empty() {
          break;
        }
        pending = Some(first);
      } else if cur <= max_probability {
        if only_child(grammar, si, &cursors, max_probability) {
          self.push(PreTerminal { structure: si, cursors: cursors.clone() }, cur);
        }
        frames.pop();
        if frames.is_empty() {
          break;
        }
        pending = Some(first);
      } else {
        // still above the window, move down the chain
        let f = frames.last_mut().expect("frame stack never empty here");
        f.cursor += 1;
        if (f.cursor as usize) < chain.len() {
          f.first = false;
        }
      }
    }
  }
}

/// True when the popped parent (which advanced slot `advanced` to produce
/// `child`) is the child's designated parent: no hypothetical parent has a
/// strictly lower joint probability, and among equal-probability parents the
/// one advancing the largest slot index wins. A slot whose node has no
/// predecessor contributes a hypothetical parent of probability 1.
fn is_designated_parent(
  grammar: &Grammar,
  child: &PreTerminal,
  advanced: usize,
  parent_probability: f64,
) -> bool {
  let s = &grammar.structures[child.structure];
  let arity = s.slots.len();
  for i in 0..arity {
    if i == advanced {
      continue;
    }
    let mut p = s.probability;
    for j in 0..arity {
      let chain = grammar.chain(s.slots[j]);
      if j != i {
        p *= chain.groups[child.cursors[j] as usize].probability;
      } else {
        match chain.prev(child.cursors[j]) {
          None => {
            p = 1.0;
            break;
          }
          Some(prev) => p *= chain.groups[prev as usize].probability,
        }
      }
    }
    if p == parent_probability {
      if i > advanced {
        return false;
      }
    } else if p < parent_probability {
      return false;
    }
  }
  true
}

/// The rebuild admission test: insert only when every proper parent sits
/// strictly above the old floor (so it was consumed before the window
/// opened and will never regenerate this child). The deepest slot needs no
/// check: the leaf walk already skipped past that parent.
fn only_child(grammar: &Grammar, si: usize, cursors: &[u16], max_probability: f64) -> bool {
  let s = &grammar.structures[si];
  let arity = s.slots.len();
  for i in 0..arity.saturating_sub(1) {
    let mut p = s.probability;
    for j in 0..arity {
      let chain = grammar.chain(s.slots[j]);
      if j != i {
        p *= chain.groups[cursors[j] as usize].probability;
      } else {
        match chain.prev(cursors[j]) {
          None => {
            p = 1.0;
            break;
          }
          Some(prev) => p *= chain.groups[prev as usize].probability,
        }
      }
    }
    if p <= max_probability {
      return false;
    }
  }
  true
}
