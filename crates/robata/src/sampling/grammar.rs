//! GBNF-subset grammars for structured output.
//!
//! A grammar definition is parsed once at startup and compiled into byte-level
//! productions; a [`GrammarState`] then answers, per candidate token, whether
//! its bytes can extend a valid sentence. The supported subset covers what
//! practical generation grammars use: rule definitions (`name ::= ...`),
//! alternation, grouping, quoted literals with the usual escapes, character
//! classes with ranges and negation, rule references, and `*`/`+`/`?`
//! repetition. Comments run from `#` to end of line.
//!
//! Terminals operate on bytes, not scalars: multi-byte UTF-8 characters in
//! literals lower to byte sequences, and negated classes span the full byte
//! range. This matches how token vocabularies split text and sidesteps
//! partial-character tokens. Left-recursive rules are not supported; their
//! expansion is cut off at a fixed depth.

use std::sync::Arc;

use tracing::warn;

use crate::error::{Error, Result};

/// A set of byte values, stored as inclusive ranges with optional negation.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ByteSet {
    ranges: Vec<(u8, u8)>,
    negated: bool,
}

impl ByteSet {
    fn single(byte: u8) -> Self {
        Self {
            ranges: vec![(byte, byte)],
            negated: false,
        }
    }

    fn contains(&self, byte: u8) -> bool {
        let hit = self.ranges.iter().any(|(lo, hi)| *lo <= byte && byte <= *hi);
        hit != self.negated
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Symbol {
    Terminal(ByteSet),
    Rule(usize),
}

/// Alternates of sequences; one entry per `|` branch.
type Alternates = Vec<Vec<Symbol>>;

/// A compiled grammar: numbered rules plus the root to start matching from.
#[derive(Debug)]
pub struct Grammar {
    rules: Vec<Alternates>,
    root: usize,
}

impl Grammar {
    /// Parses a GBNF-subset grammar definition, matching from `root_name`.
    pub fn parse(text: &str, root_name: &str) -> Result<Grammar> {
        let mut parser = Parser {
            src: text.as_bytes(),
            pos: 0,
            names: Vec::new(),
            rules: Vec::new(),
        };
        parser.parse_rules()?;

        let Parser { names, rules, .. } = parser;
        let mut compiled = Vec::with_capacity(rules.len());
        for (slot, name) in rules.into_iter().zip(&names) {
            match slot {
                Some(alternates) => compiled.push(alternates),
                None => return Err(Error::Grammar(format!("undefined rule `{name}`"))),
            }
        }
        let root = names
            .iter()
            .position(|name| name == root_name)
            .ok_or_else(|| Error::Grammar(format!("root rule `{root_name}` not defined")))?;
        Ok(Grammar {
            rules: compiled,
            root,
        })
    }
}

struct Parser<'a> {
    src: &'a [u8],
    pos: usize,
    names: Vec<String>,
    rules: Vec<Option<Alternates>>,
}

fn ident_start(byte: u8) -> bool {
    byte.is_ascii_alphabetic() || byte == b'_'
}

fn ident_char(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || byte == b'_' || byte == b'-'
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let byte = self.peek();
        if byte.is_some() {
            self.pos += 1;
        }
        byte
    }

    /// Whitespace-and-comment skip starting at `from`, without mutating.
    fn skip_ws_from(&self, mut from: usize) -> usize {
        while from < self.src.len() {
            match self.src[from] {
                b' ' | b'\t' | b'\r' | b'\n' => from += 1,
                b'#' => {
                    while from < self.src.len() && self.src[from] != b'\n' {
                        from += 1;
                    }
                }
                _ => break,
            }
        }
        from
    }

    fn skip_ws(&mut self) {
        self.pos = self.skip_ws_from(self.pos);
    }

    fn at_end(&self) -> bool {
        self.skip_ws_from(self.pos) >= self.src.len()
    }

    /// True when the next thing (past whitespace) is `ident ::=`, i.e. the
    /// current production has ended and a new rule begins. Productions may
    /// span lines, so this lookahead is the only terminator.
    fn at_rule_boundary(&self) -> bool {
        let mut p = self.skip_ws_from(self.pos);
        if p >= self.src.len() || !ident_start(self.src[p]) {
            return false;
        }
        while p < self.src.len() && ident_char(self.src[p]) {
            p += 1;
        }
        while p < self.src.len() && (self.src[p] == b' ' || self.src[p] == b'\t') {
            p += 1;
        }
        self.src[p..].starts_with(b"::=")
    }

    fn parse_ident(&mut self) -> Option<String> {
        let start = self.pos;
        if !self.peek().is_some_and(ident_start) {
            return None;
        }
        while self.peek().is_some_and(ident_char) {
            self.pos += 1;
        }
        Some(String::from_utf8_lossy(&self.src[start..self.pos]).into_owned())
    }

    fn expect(&mut self, wanted: &[u8]) -> Result<()> {
        if self.src[self.pos..].starts_with(wanted) {
            self.pos += wanted.len();
            Ok(())
        } else {
            Err(Error::Grammar(format!(
                "expected `{}` at byte {}",
                String::from_utf8_lossy(wanted),
                self.pos
            )))
        }
    }

    /// Index of a named rule, creating an empty slot on first reference.
    fn intern(&mut self, name: &str) -> usize {
        if let Some(idx) = self.names.iter().position(|n| n == name) {
            return idx;
        }
        self.names.push(name.to_owned());
        self.rules.push(None);
        self.names.len() - 1
    }

    /// Reserves a slot for a synthetic rule (groups and repetitions).
    fn reserve_anon(&mut self) -> usize {
        self.names.push(format!("<anon{}>", self.names.len()));
        self.rules.push(None);
        self.names.len() - 1
    }

    fn parse_rules(&mut self) -> Result<()> {
        loop {
            self.skip_ws();
            if self.peek().is_none() {
                break;
            }
            let name = self
                .parse_ident()
                .ok_or_else(|| Error::Grammar(format!("expected rule name at byte {}", self.pos)))?;
            self.skip_ws();
            self.expect(b"::=")?;
            let alternates = self.parse_alternates()?;
            let idx = self.intern(&name);
            if self.rules[idx].is_some() {
                return Err(Error::Grammar(format!("rule `{name}` defined twice")));
            }
            self.rules[idx] = Some(alternates);
        }
        Ok(())
    }

    fn parse_alternates(&mut self) -> Result<Alternates> {
        let mut alternates = vec![self.parse_sequence()?];
        loop {
            self.skip_ws();
            if self.peek() == Some(b'|') {
                self.bump();
                alternates.push(self.parse_sequence()?);
            } else {
                break;
            }
        }
        Ok(alternates)
    }

    fn parse_sequence(&mut self) -> Result<Vec<Symbol>> {
        let mut sequence = Vec::new();
        loop {
            self.skip_ws();
            match self.peek() {
                None | Some(b'|') | Some(b')') => break,
                _ if self.at_rule_boundary() => break,
                _ => sequence.append(&mut self.parse_element()?),
            }
        }
        Ok(sequence)
    }

    fn parse_element(&mut self) -> Result<Vec<Symbol>> {
        let symbols = match self.peek() {
            Some(b'"') => self.parse_literal()?,
            Some(b'[') => vec![Symbol::Terminal(self.parse_byte_set()?)],
            Some(b'(') => {
                self.bump();
                let alternates = self.parse_alternates()?;
                self.skip_ws();
                self.expect(b")")?;
                let idx = self.reserve_anon();
                self.rules[idx] = Some(alternates);
                vec![Symbol::Rule(idx)]
            }
            Some(byte) if ident_start(byte) => {
                let name = self.parse_ident().unwrap_or_default();
                vec![Symbol::Rule(self.intern(&name))]
            }
            other => {
                return Err(Error::Grammar(format!(
                    "unexpected character {:?} at byte {}",
                    other.map(char::from),
                    self.pos
                )));
            }
        };

        // Postfix repetition binds to the element just parsed, lowering to a
        // synthetic self-referencing rule.
        Ok(match self.peek() {
            Some(b'*') => {
                self.bump();
                let idx = self.reserve_anon();
                let mut again = symbols.clone();
                again.push(Symbol::Rule(idx));
                self.rules[idx] = Some(vec![again, vec![]]);
                vec![Symbol::Rule(idx)]
            }
            Some(b'+') => {
                self.bump();
                let idx = self.reserve_anon();
                let mut again = symbols.clone();
                again.push(Symbol::Rule(idx));
                self.rules[idx] = Some(vec![again, symbols]);
                vec![Symbol::Rule(idx)]
            }
            Some(b'?') => {
                self.bump();
                let idx = self.reserve_anon();
                self.rules[idx] = Some(vec![symbols, vec![]]);
                vec![Symbol::Rule(idx)]
            }
            _ => symbols,
        })
    }

    fn parse_escape(&mut self) -> Result<u8> {
        match self.bump() {
            Some(b'n') => Ok(b'\n'),
            Some(b't') => Ok(b'\t'),
            Some(b'r') => Ok(b'\r'),
            Some(byte @ (b'"' | b'\\' | b'[' | b']' | b'-' | b'^')) => Ok(byte),
            other => Err(Error::Grammar(format!(
                "unsupported escape {:?} at byte {}",
                other.map(char::from),
                self.pos
            ))),
        }
    }

    /// A quoted literal lowers to one single-byte terminal per byte.
    fn parse_literal(&mut self) -> Result<Vec<Symbol>> {
        self.expect(b"\"")?;
        let mut symbols = Vec::new();
        loop {
            match self.bump() {
                None => return Err(Error::Grammar("unterminated literal".into())),
                Some(b'"') => break,
                Some(b'\\') => symbols.push(Symbol::Terminal(ByteSet::single(self.parse_escape()?))),
                Some(byte) => symbols.push(Symbol::Terminal(ByteSet::single(byte))),
            }
        }
        Ok(symbols)
    }

    fn parse_byte_set(&mut self) -> Result<ByteSet> {
        self.expect(b"[")?;
        let negated = if self.peek() == Some(b'^') {
            self.bump();
            true
        } else {
            false
        };
        let mut ranges = Vec::new();
        loop {
            let lo = match self.bump() {
                None => return Err(Error::Grammar("unterminated character class".into())),
                Some(b']') => break,
                Some(b'\\') => self.parse_escape()?,
                Some(byte) => byte,
            };
            // `a-z` forms a range unless the dash closes the class.
            if self.peek() == Some(b'-') && self.src.get(self.pos + 1) != Some(&b']') {
                self.bump();
                let hi = match self.bump() {
                    None => return Err(Error::Grammar("unterminated character class".into())),
                    Some(b'\\') => self.parse_escape()?,
                    Some(byte) => byte,
                };
                ranges.push((lo, hi));
            } else {
                ranges.push((lo, lo));
            }
        }
        Ok(ByteSet { ranges, negated })
    }
}

/// Expansion cutoff; reaching it means the grammar is left-recursive.
const MAX_EXPANSION_DEPTH: usize = 128;

/// A pushdown parse state over a compiled grammar.
///
/// The state is a set of expansion stacks, each with a terminal (or nothing,
/// for a completed sentence) on top. Feeding a byte advances every stack
/// whose top terminal matches and discards the rest; an empty resulting set
/// means the byte is rejected.
#[derive(Debug, Clone)]
pub struct GrammarState {
    grammar: Arc<Grammar>,
    stacks: Vec<Vec<Symbol>>,
}

impl GrammarState {
    pub fn new(grammar: Arc<Grammar>) -> Self {
        let mut stacks = Vec::new();
        expand(&grammar, vec![Symbol::Rule(grammar.root)], &mut stacks, 0);
        Self { grammar, stacks }
    }

    /// Whether `bytes` can extend a valid sentence from the current state,
    /// without committing. Empty input extends nothing.
    pub fn accepts(&self, bytes: &[u8]) -> bool {
        if bytes.is_empty() {
            return false;
        }
        let mut stacks = self.stacks.clone();
        for byte in bytes {
            stacks = step_stacks(&self.grammar, &stacks, *byte);
            if stacks.is_empty() {
                return false;
            }
        }
        true
    }

    /// Commits `bytes` into the parse state. Returns false (leaving the
    /// state rejecting everything) if some byte cannot be matched.
    pub fn advance(&mut self, bytes: &[u8]) -> bool {
        for byte in bytes {
            self.stacks = step_stacks(&self.grammar, &self.stacks, *byte);
            if self.stacks.is_empty() {
                return false;
            }
        }
        true
    }

    /// Whether the input consumed so far forms a complete sentence.
    pub fn can_terminate(&self) -> bool {
        self.stacks.iter().any(|stack| stack.is_empty())
    }
}

fn step_stacks(grammar: &Grammar, stacks: &[Vec<Symbol>], byte: u8) -> Vec<Vec<Symbol>> {
    let mut next = Vec::new();
    for stack in stacks {
        if let Some(Symbol::Terminal(set)) = stack.last() {
            if set.contains(byte) {
                let mut advanced = stack.clone();
                advanced.pop();
                expand(grammar, advanced, &mut next, 0);
            }
        }
    }
    next
}

/// Rewrites a stack until its top is a terminal (or it is empty), branching
/// across alternates. Deduplicates into `out`.
fn expand(grammar: &Grammar, stack: Vec<Symbol>, out: &mut Vec<Vec<Symbol>>, depth: usize) {
    if depth > MAX_EXPANSION_DEPTH {
        warn!("grammar expansion depth exceeded; dropping a left-recursive branch");
        return;
    }
    match stack.last() {
        None | Some(Symbol::Terminal(_)) => {
            if !out.contains(&stack) {
                out.push(stack);
            }
        }
        Some(Symbol::Rule(rule)) => {
            let rule = *rule;
            let mut base = stack;
            base.pop();
            for alternate in &grammar.rules[rule] {
                let mut branch = base.clone();
                branch.extend(alternate.iter().rev().cloned());
                expand(grammar, branch, out, depth + 1);
            }
        }
    }
}
