
use std::io::{self, BufRead, Read, Write};

use log::debug;

use crate::chains::{Charsets, NodeRef, SymbolKind};
use crate::errors::{Error, Result};
use crate::grammar::Grammar;
use crate::materialize;

pub const STREAM_VERSION: f64 = 1.75;
pub const END_OF_DICTIONARIES: &str = "---End_of_Dictionaries---";

/// The text preamble of a precompute stream. The consumer reloads the same
/// wordlists and ruleset so its chains line up with the producer's rainbow
/// indices before any binary record is decoded.
#[derive(Clone, Debug, PartialEq)]
pub struct StreamHeader {
  pub rules: String,
  pub keep_upper: bool,
  pub keep_special: bool,
  pub keep_digits: bool,
  pub wordlists: Vec<(String, f64)>,
}

pub fn write_header<W: Write>(out: &mut W, header: &StreamHeader) -> io::Result<()> {
  writeln!(out, "Version:\t{}", STREAM_VERSION)?;
  writeln!(out, "Rules:\t{}", header.rules)?;
  writeln!(out, "KeepUpper:\t{}", header.keep_upper as u8)?;
  writeln!(out, "KeepSpecial:\t{}", header.keep_special as u8)?;
  writeln!(out, "KeepDigits:\t{}", header.keep_digits as u8)?;
  for (path, prior) in &header.wordlists {
    writeln!(out, "{}", path)?;
    writeln!(out, "{}", prior)?;
  }
  writeln!(out, "{}", END_OF_DICTIONARIES)?;
  Ok(())
}

pub(crate) fn read_line<R: BufRead>(input: &mut R) -> Result<String> {
  let mut line = String::new();
  if input.read_line(&mut line)? == 0 {
    return Err(Error::input("unexpected end of precompute header"));
  }
  while line.ends_with('\n') || line.ends_with('\r') {
    line.pop();
  }
  Ok(line)
}

pub(crate) fn read_field<R: BufRead>(input: &mut R, name: &str) -> Result<String> {
  let line = read_line(input)?;
  line
    .strip_prefix(name)
    .and_then(|rest| rest.strip_prefix('\t'))
    .map(|v| v.to_owned())
    .ok_or_else(|| Error::input(format!("expected {:?} line, got {:?}", name, line)))
}

pub(crate) fn read_flag<R: BufRead>(input: &mut R, name: &str) -> Result<bool> {
  match read_field(input, name)?.trim() {
    "0" => Ok(false),
    "1" => Ok(true),
    other => Err(Error::input(format!("{} must be 0 or 1, got {:?}", name, other))),
  }
}

pub fn read_header<R: BufRead>(input: &mut R) -> Result<StreamHeader> {
  let version: f64 = read_field(input, "Version:")?
    .trim()
    .parse()
    .map_err(|_| Error::input("unparsable stream version"))?;
  if version < STREAM_VERSION {
    return Err(Error::input(format!(
      "precompute stream version {} is no longer supported",
      version
    )));
  }
  let rules = read_field(input, "Rules:")?;
  if rules.is_empty() {
    return Err(Error::input("empty rules name in precompute header"));
  }
  let keep_upper = read_flag(input, "KeepUpper:")?;
  let keep_special = read_flag(input, "KeepSpecial:")?;
  let keep_digits = read_flag(input, "KeepDigits:")?;

  let mut wordlists = vec![];
  loop {
    let line = read_line(input)?;
    if line == END_OF_DICTIONARIES {
      break;
    }
    let prior: f64 = read_line(input)?
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
  Ok(StreamHeader { rules, keep_upper, keep_special, keep_digits, wordlists })
}

/// Serializes one popped pre-terminal: a slot count byte, then three bytes
/// per slot. Byte 0 carries the brute-force bit and the rainbow length;
/// byte 1 packs the replace rule, the rainbow category and the top two bits
/// of the 10-bit rainbow index; byte 2 is the low byte of the index.
pub fn write_record<W: Write>(out: &mut W, grammar: &Grammar, slots: &[NodeRef]) -> Result<()> {
  if slots.len() > u8::MAX as usize {
    return Err(Error::input(format!("pre-terminal arity {} too large to serialize", slots.len())));
  }
  let mut record = Vec::with_capacity(1 + slots.len() * 3);
  record.push(slots.len() as u8);
  for node in slots {
    let group = grammar.group(*node);
    let rainbow = group.rainbow;
    if rainbow.index > 0x3FF {
      return Err(Error::input(format!(
        "rainbow index {} exceeds the 10-bit record field",
        rainbow.index
      )));
    }
    let mut b0 = rainbow.length & 0x7F;
    if group.brute.is_some() {
      b0 |= 0x80;
    }
    let b1 = (group.rule.code() << 5)
      | ((rainbow.category.code() & 0x7) << 2)
      | ((rainbow.index >> 8) as u8 & 0x3);
    let b2 = (rainbow.index & 0xFF) as u8;
    record.extend_from_slice(&[b0, b1, b2]);
  }
  out.write_all(&record)?;
  Ok(())
}

/// Reads one record and reattaches its slots to the loaded grammar through
/// their rainbow triples. Returns None on a clean end of stream.
pub fn read_record<R: Read>(input: &mut R, grammar: &Grammar) -> Result<Option<Vec<NodeRef>>> {
  let mut size = [0u8; 1];
  match input.read_exact(&mut size) {
    Ok(()) => {}
    Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
    Err(e) => return Err(e.into()),
  }
  let mut slots = Vec::with_capacity(size[0] as usize);
  for _ in 0..size[0] {
    let mut b = [0u8; 3];
    input
      .read_exact(&mut b)
      .map_err(|_| Error::input("truncated precompute record"))?;
    let length = (b[0] & 0x7F) as usize;
    let category = SymbolKind::from_code((b[1] >> 2) & 0x7)
      .ok_or_else(|| Error::input(format!("invalid rainbow category {}", (b[1] >> 2) & 0x7)))?;
    let index = (((b[1] & 0x3) as u16) << 8) | b[2] as u16;
    let node = grammar
      .node_for_rainbow(category, length, index)
      .ok_or(Error::MissingTerminal { kind: category, length })?;
    slots.push(node);
  }
  Ok(Some(slots))
}

/// Client mode: decode every record on the stream and expand it to guesses.
pub fn consume<R: Read, W: Write>(
  input: &mut R,
  grammar: &Grammar,
  charsets: &Charsets,
  out: &mut W,
) -> Result<u64> {
  let mut guesses = 0u64;
  let mut records = 0u64;
  while let Some(slots) = read_record(input, grammar)? {
    guesses += materialize::emit(grammar, charsets, &slots, out)?;
    records += 1;
  }
  debug!("consumed {} precomputed pre-terminals", records);
  out.flush()?;
  Ok(guesses)
}
