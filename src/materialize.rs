
use std::io::{self, Write};

use crate::chains::{Charsets, NodeRef, ReplaceRule};
use crate::grammar::Grammar;

/// Expands a pre-terminal's resolved slots into concrete guesses, one per
/// line, streaming the Cartesian product left-to-right. Returns the number
/// of guesses written.
pub fn emit<W: Write>(
  grammar: &Grammar,
  charsets: &Charsets,
  slots: &[NodeRef],
  out: &mut W,
) -> io::Result<u64> {
  if slots.is_empty() {
    return Ok(0);
  }
  let mut buf = String::new();
  emit_section(grammar, charsets, slots, 0, &mut buf, out)
}

fn emit_section<W: Write>(
  grammar: &Grammar,
  charsets: &Charsets,
  slots: &[NodeRef],
  section: usize,
  buf: &mut String,
  out: &mut W,
) -> io::Result<u64> {
  let group = grammar.group(slots[section]);
  let mark = buf.len();
  let last = section + 1 == slots.len();
  let mut emitted = 0u64;

  if let Some(brute) = group.brute {
    let charset: Vec<char> = charsets.get(brute.charset).chars().collect();
    let k = charset.len() as u128;
    let total = k.pow(brute.length as u32);
    // indices already covered by literal groups of the same chain are
    // skipped; the list is sorted and the walk is monotonic
    let mut seen = grammar.seen(slots[section].chain).iter().peekable();
    let mut index: u128 = 0;
    loop {
      while let Some(&&s) = seen.peek() {
        if s > index {
          break;
        }
        if s == index {
          index += 1;
        }
        seen.next();
      }
      if index >= total {
        break;
      }
      buf.truncate(mark);
      let mut cur = index;
      for _ in 0..brute.length {
        buf.push(charset[(cur % k) as usize]);
        cur /= k;
      }
      if last {
        writeln!(out, "{}", buf)?;
        emitted += 1;
      } else {
        emitted += emit_section(grammar, charsets, slots, section + 1, buf, out)?;
      }
      index += 1;
    }
  } else {
    match group.rule {
      ReplaceRule::Literal => {
        for replacement in &group.replacements {
          buf.truncate(mark);
          buf.push_str(replacement);
          if last {
            writeln!(out, "{}", buf)?;
            emitted += 1;
          } else {
            emitted += emit_section(grammar, charsets, slots, section + 1, buf, out)?;
          }
        }
      }
      ReplaceRule::Mask => {
        // a mask slot always modifies the word slot that follows it
        debug_assert!(!last, "mask slot with no following word slot");
        if !last {
          for mask in &group.replacements {
            emitted += emit_masked(grammar, charsets, slots, section + 1, mask, buf, out)?;
          }
        }
      }
      ReplaceRule::Lowercase => {
        debug_assert!(!last, "lowercase slot with no following word slot");
        if !last {
          emitted += emit_section(grammar, charsets, slots, section + 1, buf, out)?;
        }
      }
    }
  }

  buf.truncate(mark);
  Ok(emitted)
}

fn emit_masked<W: Write>(
  grammar: &Grammar,
  charsets: &Charsets,
  slots: &[NodeRef],
  section: usize,
  mask: &str,
  buf: &mut String,
  out: &mut W,
) -> io::Result<u64> {
  let group = grammar.group(slots[section]);
  let mark = buf.len();
  let last = section + 1 == slots.len();
  let mut emitted = 0u64;

  for word in &group.replacements {
    buf.truncate(mark);
    for (m, c) in mask.chars().zip(word.chars()) {
      if m == 'L' {
        buf.push(c);
      } else {
        buf.extend(c.to_uppercase());
      }
    }
    if last {
      writeln!(out, "{}", buf)?;
      emitted += 1;
    } else {
      emitted += emit_section(grammar, charsets, slots, section + 1, buf, out)?;
    }
  }

  buf.truncate(mark);
  Ok(emitted)
}

/// Count-only mode: the number of guesses `emit` would produce, as a plain
/// product of slot cardinalities. A brute-force slot of length L contributes
/// |charset|^L (seen-index skips are not subtracted).
pub fn count(grammar: &Grammar, charsets: &Charsets, slots: &[NodeRef]) -> u128 {
  let mut total: u128 = 1;
  for node in slots {
    let group = grammar.group(*node);
    total *= match group.brute {
      Some(brute) => (charsets.get(brute.charset).chars().count() as u128).pow(brute.length as u32),
      None => group.replacements.len() as u128,
    };
  }
  total
}
