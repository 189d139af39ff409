
use std::cell::Cell;
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::PathBuf;
use std::process::exit;
use std::rc::Rc;

use clap::Parser;
use console::style;
use itertools::Itertools;
use log::{error, info};

use pcfg_guesser::chains::Charsets;
use pcfg_guesser::dictionary::{WordlistFilters, WordlistSpec};
use pcfg_guesser::errors::{Error, Result};
use pcfg_guesser::grammar::{load_rules, Grammar, RulesConfig};
use pcfg_guesser::passphrase::{load_passphrase_grammar, PassphraseConfig, DEFAULT_MIN_SLOTS};
use pcfg_guesser::precompute;
use pcfg_guesser::queue::GuessQueue;
use pcfg_guesser::recovery::{restore, RecoveryConfig, RecoveryFile};
use pcfg_guesser::session::{Mode, Outcome, Session, Status};

/// Generates password guesses from a trained probabilistic context-free
/// grammar, in strictly decreasing probability order.
#[derive(Parser, Debug)]
#[command()]
struct Args {
  /// Input wordlist; repeat for multiple lists (at most 10)
  #[arg(long = "wordlist")]
  wordlists: Vec<PathBuf>,

  /// Prior probability of the matching --wordlist (defaults to 1.0 each;
  /// priors are renormalized to sum to 1)
  #[arg(long = "wordlist-prob")]
  wordlist_probs: Vec<f64>,

  /// Name of the trained ruleset under <base-dir>/Rules/
  #[arg(long, default_value = "Default")]
  rules: String,

  #[arg(long, default_value = ".")]
  base_dir: PathBuf,

  /// Name of the recovery file for this session
  #[arg(long, default_value = "save")]
  session: String,

  /// Resume a stopped session; every other option is read from its
  /// recovery file
  #[arg(long)]
  restore: Option<String>,

  /// Queue size cap; trimming halves the queue and raises the floor
  #[arg(long, default_value_t = 200_000)]
  queue_cap: usize,

  /// Stop after this many pre-terminals
  #[arg(long)]
  max_preterminals: Option<u64>,

  /// Keep dictionary words containing uppercase letters
  #[arg(long)]
  keep_upper: bool,

  /// Keep dictionary words containing special characters
  #[arg(long)]
  keep_special: bool,

  /// Keep dictionary words containing digits
  #[arg(long)]
  keep_digits: bool,

  /// Report guess counts instead of emitting guesses
  #[arg(long)]
  count_only: bool,

  /// Write precompute records to this file instead of guesses ("-" for
  /// stdout)
  #[arg(long, conflicts_with = "client")]
  pregen: Option<String>,

  /// Consume a precompute stream from this file ("-" for stdin)
  #[arg(long)]
  client: Option<String>,

  /// Run a passphrase attack over part-of-speech phrase dictionaries
  #[arg(long)]
  passphrase: bool,

  /// Minimum phrase slots for a passphrase structure to be kept
  #[arg(long, default_value_t = DEFAULT_MIN_SLOTS)]
  min_phrase_slots: usize,

  /// Tag-to-dictionary mapping for passphrase mode
  #[arg(long, default_value = "res/brown_tagset.json")]
  tagset: PathBuf,
}

fn main() {
  env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

  let args = Args::parse();
  if let Err(e) = run(args) {
    error!("{}", e);
    exit(1);
  }
}

fn run(args: Args) -> Result<()> {
  if args.passphrase {
    return run_passphrase(&args);
  }
  if let Some(client) = &args.client {
    return run_client(&args, client);
  }

  // A restored session takes its configuration from the recovery file.
  let (config, restore_point) = match &args.restore {
    Some(name) => {
      let (config, point) = RecoveryFile::load(&args.base_dir.join(format!("{}.rec", name)))?;
      (config, Some(point))
    }
    None => (
      RecoveryConfig {
        rules: args.rules.clone(),
        keep_upper: args.keep_upper,
        keep_special: args.keep_special,
        keep_digits: args.keep_digits,
        precompute_mode: if args.pregen.is_some() { 1 } else { 0 },
        wordlists: wordlist_pairs(&args)?,
      },
      None,
    ),
  };

  let charsets = Charsets::default();
  let grammar = load_rules(
    &RulesConfig {
      base_dir: args.base_dir.clone(),
      rule_name: config.rules.clone(),
      wordlists: config
        .wordlists
        .iter()
        .map(|(path, prior)| WordlistSpec { path: PathBuf::from(path), prior: *prior })
        .collect(),
      filters: WordlistFilters {
        keep_upper: config.keep_upper,
        keep_special: config.keep_special,
        keep_digits: config.keep_digits,
      },
    },
    &charsets,
  )?;
  info!(
    "loaded {} base structures over {} terminal chains from {}",
    grammar.structures.len(),
    grammar.chains.len(),
    config.wordlists.iter().map(|(path, _)| path.as_str()).join(", ")
  );

  let mut queue = GuessQueue::new(args.queue_cap);
  queue.seed(&grammar);
  if let Some(point) = restore_point {
    restore(&mut queue, &grammar, point);
    info!("restored session at probability {}", point);
  }

  let session_name = args.restore.as_deref().unwrap_or(args.session.as_str());
  let recovery = RecoveryFile::create(
    &args.base_dir.join(format!("{}.rec", session_name)),
    &config,
    restore_point.unwrap_or(1.0),
  )?;

  let (mode, sink) = output_for(&args, &config, restore_point.is_some())?;
  let mut session = Session::new(&grammar, queue, sink);
  session.charsets = charsets;
  session.checkpoint = Some(recovery);
  session.max_preterminals = args.max_preterminals;

  let total = Rc::new(Cell::new(0u128));
  if mode == Mode::CountOnly {
    let total = total.clone();
    session.status = Some(Box::new(move |s: &Status| {
      total.set(s.guesses);
      eprintln!(
        "guesses={} preterminals={} queue={} p={}",
        s.guesses, s.preterminals, s.queue_len, s.probability
      );
    }));
  }

  let outcome = session.run(mode)?;
  match outcome {
    Outcome::Exhausted => info!("grammar exhausted, no guesses remain"),
    Outcome::CapReached => info!("stopped at the configured pre-terminal cap"),
    Outcome::Stopped => info!("stopped on request"),
  }
  if mode == Mode::CountOnly {
    eprintln!("{}", style(format!("total guesses: {}", total.get())).bold());
  }
  Ok(())
}

fn wordlist_pairs(args: &Args) -> Result<Vec<(String, f64)>> {
  if args.wordlists.is_empty() {
    return Err(Error::input("at least one --wordlist is required"));
  }
  if !args.wordlist_probs.is_empty() && args.wordlist_probs.len() != args.wordlists.len() {
    return Err(Error::input(format!(
      "{} --wordlist-prob values for {} wordlists",
      args.wordlist_probs.len(),
      args.wordlists.len()
    )));
  }
  Ok(
    args
      .wordlists
      .iter()
      .enumerate()
      .map(|(i, path)| {
        let prior = args.wordlist_probs.get(i).copied().unwrap_or(1.0);
        (path.display().to_string(), prior)
      })
      .collect(),
  )
}

/// Picks the session mode and its sink. Guesses stream to stdout; pregen
/// records go to the named file (with the stream header on a fresh run) or
/// to stdout.
fn output_for(
  args: &Args,
  config: &RecoveryConfig,
  restored: bool,
) -> Result<(Mode, Box<dyn Write>)> {
  if let Some(pregen) = &args.pregen {
    let header = precompute::StreamHeader {
      rules: config.rules.clone(),
      keep_upper: config.keep_upper,
      keep_special: config.keep_special,
      keep_digits: config.keep_digits,
      wordlists: config.wordlists.clone(),
    };
    let mut sink: Box<dyn Write> = if pregen == "-" {
      Box::new(BufWriter::new(io::stdout().lock()))
    } else if restored {
      Box::new(BufWriter::new(OpenOptions::new().append(true).open(pregen)?))
    } else {
      Box::new(BufWriter::new(File::create(pregen)?))
    };
    if !restored {
      precompute::write_header(&mut sink, &header)?;
    }
    return Ok((Mode::Precompute, sink));
  }
  let mode = if args.count_only { Mode::CountOnly } else { Mode::Generate };
  Ok((mode, Box::new(BufWriter::new(io::stdout().lock()))))
}

/// Client mode: rebuild the producer's grammar from the stream header, then
/// expand every record to guesses.
fn run_client(args: &Args, client: &str) -> Result<()> {
  let mut input: BufReader<Box<dyn Read>> = BufReader::new(if client == "-" {
    Box::new(io::stdin().lock())
  } else {
    Box::new(File::open(client).map_err(|e| {
      Error::input(format!("could not open precompute stream {}: {}", client, e))
    })?)
  });

  let header = precompute::read_header(&mut input)?;
  let charsets = Charsets::default();
  let grammar = load_rules(
    &RulesConfig {
      base_dir: args.base_dir.clone(),
      rule_name: header.rules.clone(),
      wordlists: header
        .wordlists
        .iter()
        .map(|(path, prior)| WordlistSpec { path: PathBuf::from(path), prior: *prior })
        .collect(),
      filters: WordlistFilters {
        keep_upper: header.keep_upper,
        keep_special: header.keep_special,
        keep_digits: header.keep_digits,
      },
    },
    &charsets,
  )?;

  let mut out = BufWriter::new(io::stdout().lock());
  let guesses = precompute::consume(&mut input, &grammar, &charsets, &mut out)?;
  info!("expanded {} guesses from the precompute stream", guesses);
  Ok(())
}

fn run_passphrase(args: &Args) -> Result<()> {
  let charsets = Charsets::default();
  let mut grammar: Grammar = load_passphrase_grammar(&PassphraseConfig {
    base_dir: args.base_dir.clone(),
    tagset: args.tagset.clone(),
    min_slots: args.min_phrase_slots,
  })?;
  grammar.build_seen_indices(&charsets);
  info!("loaded {} phrase structures", grammar.structures.len());

  let mut queue = GuessQueue::new(args.queue_cap);
  queue.seed(&grammar);

  let mut session = Session::new(&grammar, queue, Box::new(BufWriter::new(io::stdout().lock())) as Box<dyn Write>);
  session.charsets = charsets;
  session.max_preterminals = args.max_preterminals;
  let mode = if args.count_only { Mode::CountOnly } else { Mode::Generate };
  session.run(mode)?;
  Ok(())
}
