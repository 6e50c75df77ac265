//! The stack language: a reverse-polish mini-language for building graphs.
//!
//! Tokens either push nodes (factory URIs, `filter:` names, numeric and
//! `$` literals), assign properties on the top of the stack, define and
//! invoke words, or manipulate the stack itself. Filters bind their
//! upstream slots lazily: pushing `filter:clip` consumes nothing until the
//! next operation forces resolution, at which point unbound slots fill
//! from the stack.
//!
//! ```text
//! test: filter:clip in=10 out=60
//! : preview filter:clip out=%s ;
//! test: 25 preview
//! ```

mod tokens;

pub use tokens::{strip_quotes, tokenize};

use crate::error::{Error, Result};
use crate::factory::{NodeFactory, NodeRegistry};
use crate::inputs::ValueNode;
use crate::node::{Node, NodeHandle};
use std::collections::HashMap;
use std::sync::Arc;

/// The interpreter: an operand stack of nodes plus a word dictionary.
pub struct Stack {
    items: Vec<NodeHandle>,
    words: HashMap<String, Vec<String>>,
    factory: Arc<dyn NodeFactory>,
    defining: bool,
    depth_count: u32,
    pending: Vec<String>,
    literal_next: bool,
    forget_next: bool,
}

impl Stack {
    /// Create a stack over an injected factory.
    pub fn new(factory: Arc<dyn NodeFactory>) -> Self {
        Self {
            items: Vec::new(),
            words: HashMap::new(),
            factory,
            defining: false,
            depth_count: 0,
            pending: Vec::new(),
            literal_next: false,
            forget_next: false,
        }
    }

    /// Create a stack over the standard registry.
    pub fn standard() -> Self {
        Self::new(NodeRegistry::standard())
    }

    /// Current stack depth.
    pub fn depth(&self) -> usize {
        self.items.len()
    }

    /// Tokenise and apply a program fragment.
    pub fn push(&mut self, program: &str) -> Result<()> {
        for token in tokenize(program)? {
            self.apply(&token)?;
        }
        Ok(())
    }

    /// Pop the top of the stack, forcing resolution and slot binding.
    ///
    /// Unbound filter slots fill from the stack in reverse slot order; an
    /// underflow while binding removes the filter and everything it
    /// consumed, then fails.
    pub fn pop(&mut self) -> Result<NodeHandle> {
        if self.defining {
            return Err(Error::Syntax("unclosed word definition".to_string()));
        }
        let node = self.items.pop().ok_or(Error::StackUnderflow)?;
        node.init()?;
        for index in (0..node.slot_count()).rev() {
            if node.slot(index).is_none() {
                let upstream = self.pop().map_err(|error| match error {
                    Error::StackUnderflow => Error::GraphConnection(format!(
                        "underflow binding slot {index} of {}",
                        node.uri()
                    )),
                    other => other,
                })?;
                if !node.connect(upstream, index) {
                    return Err(Error::GraphConnection(format!(
                        "slot {index} of {} rejected the connection",
                        node.uri()
                    )));
                }
            }
        }
        Ok(node)
    }

    /// Pop and return the top of the stack, or `None` when empty.
    ///
    /// The one stack operation that never underflows; resolution failures
    /// still surface.
    pub fn release(&mut self) -> Result<Option<NodeHandle>> {
        if self.items.is_empty() {
            return Ok(None);
        }
        self.pop().map(Some)
    }

    /// Apply one token.
    fn apply(&mut self, token: &str) -> Result<()> {
        if token.is_empty() {
            return Ok(());
        }

        // Word definitions swallow everything except nesting markers.
        if self.defining && token != ":" && token != ";" {
            self.pending.push(strip_quotes(token).to_string());
            return Ok(());
        }

        if self.literal_next {
            self.literal_next = false;
            self.force_top()?;
            self.push_value(strip_quotes(token));
            return Ok(());
        }

        if self.forget_next {
            self.forget_next = false;
            return self.forget_word(strip_quotes(token));
        }

        let arg = strip_quotes(token).to_string();
        match arg.as_str() {
            ":" => self.begin_word(),
            ";" => self.end_word(),
            "$" => {
                self.literal_next = true;
                Ok(())
            }
            "forget" => {
                self.forget_next = true;
                Ok(())
            }
            _ => {
                if let Some(body) = self.words.get(&arg).cloned() {
                    // Invocation-time expansion: nested words resolve now.
                    for token in body {
                        self.apply(&token)?;
                    }
                    Ok(())
                } else if is_operation(&arg) {
                    self.force_top()?;
                    self.execute(&arg)
                } else if is_numeric(&arg) {
                    self.force_top()?;
                    self.push_value(normalize_numeric(&arg));
                    Ok(())
                } else if arg.contains('=') {
                    self.assign_top(&arg)
                } else if let Some(name) = arg.strip_prefix("filter:") {
                    self.force_top()?;
                    let filter = self.factory.create_filter(name);
                    self.items.push(filter);
                    Ok(())
                } else {
                    self.force_top()?;
                    let input = self.factory.create_input(&arg);
                    self.items.push(input);
                    Ok(())
                }
            }
        }
    }

    /// Resolve the current top before anything new lands on it. This is
    /// where lazily failing pushes and deferred slot binding surface.
    fn force_top(&mut self) -> Result<()> {
        if !self.items.is_empty() {
            let node = self.pop()?;
            self.items.push(node);
        }
        Ok(())
    }

    fn push_value(&mut self, value: impl Into<String>) {
        self.items.push(Arc::new(ValueNode::new(value.into())));
    }

    fn begin_word(&mut self) -> Result<()> {
        if self.defining {
            self.depth_count += 1;
            self.pending.push(":".to_string());
        } else {
            self.defining = true;
            self.depth_count = 1;
            self.pending.clear();
        }
        Ok(())
    }

    fn end_word(&mut self) -> Result<()> {
        if self.defining && self.depth_count == 1 {
            self.defining = false;
            self.depth_count = 0;
            if self.pending.is_empty() {
                return Err(Error::Syntax("empty word definition".to_string()));
            }
            let name = self.pending.remove(0);
            let body = std::mem::take(&mut self.pending);
            self.words.insert(name, body);
            Ok(())
        } else if self.depth_count > 1 {
            self.depth_count -= 1;
            self.pending.push(";".to_string());
            Ok(())
        } else {
            Err(Error::Syntax("badly formed word definition".to_string()))
        }
    }

    fn forget_word(&mut self, name: &str) -> Result<()> {
        match self.words.remove(name) {
            Some(_) => Ok(()),
            None => Err(Error::UnknownWord(name.to_string())),
        }
    }

    /// Property assignment `name=value` against the top of the stack.
    fn assign_top(&mut self, pair: &str) -> Result<()> {
        let eq = pair.find('=').expect("caller checked for '='");
        let name = &pair[..eq];
        let mut value = strip_quotes(&pair[eq + 1..]).to_string();

        let target = self.items.last().cloned().ok_or(Error::StackUnderflow)?;
        if let Err(error) = target.init() {
            // A lazily failed push surfaces here; discard it.
            self.items.pop();
            return Err(error);
        }

        if value.contains("%s") {
            value = self.substitute(&value)?;
        }

        target.properties().assign(name, &value)
    }

    /// Fill `%s` placeholders by consuming values from below the target.
    ///
    /// Consumption is right-to-left: the rightmost placeholder takes the
    /// most recently pushed value.
    fn substitute(&mut self, value: &str) -> Result<String> {
        let parts: Vec<&str> = value.split("%s").collect();
        let placeholders = parts.len() - 1;

        let mut consumed = Vec::with_capacity(placeholders);
        for _ in 0..placeholders {
            if self.items.len() < 2 {
                return Err(Error::StackUnderflow);
            }
            let index = self.items.len() - 2;
            consumed.push(self.items.remove(index).uri());
        }

        let mut result = String::new();
        for (index, part) in parts.iter().enumerate() {
            result.push_str(part);
            if index < placeholders {
                result.push_str(&consumed[placeholders - 1 - index]);
            }
        }
        Ok(result)
    }

    /// Pop a numeric operand without resolving it.
    fn pop_number(&mut self) -> Result<f64> {
        let node = self.items.pop().ok_or(Error::StackUnderflow)?;
        Ok(node.uri().parse().unwrap_or(0.0))
    }

    fn pop_index(&mut self) -> Result<i64> {
        Ok(self.pop_number()? as i64)
    }

    fn execute(&mut self, name: &str) -> Result<()> {
        match name {
            "+" | "-" | "*" | "/" => {
                let a = self.pop_number()?;
                let b = self.pop_number()?;
                let result = match name {
                    "+" => b + a,
                    "-" => b - a,
                    "*" => b * a,
                    _ => b / a,
                };
                self.push_value(format_number(result));
                Ok(())
            }
            "drop" => {
                self.pop()?;
                Ok(())
            }
            "pick" => {
                let n = self.pop_index()?;
                let len = self.items.len() as i64;
                if n < 0 || n >= len {
                    return Err(Error::StackUnderflow);
                }
                // A shared reference, not a clone.
                let item = self.items[(len - 1 - n) as usize].clone();
                self.items.push(item);
                Ok(())
            }
            "roll" => {
                let n = self.pop_index()?;
                let len = self.items.len() as i64;
                if n < 0 || n >= len {
                    return Err(Error::StackUnderflow);
                }
                let item = self.items.remove((len - 1 - n) as usize);
                self.items.push(item);
                Ok(())
            }
            "shift" => {
                let n = self.pop_index()?;
                let len = self.items.len() as i64;
                if n < 0 || n >= len {
                    return Err(Error::StackUnderflow);
                }
                let item = self.items.pop().expect("checked depth above");
                let index = self.items.len() - n as usize;
                self.items.insert(index, item);
                Ok(())
            }
            "depth?" => {
                self.push_value(self.items.len().to_string());
                Ok(())
            }
            "length?" => {
                let node = self.pop()?;
                node.sync();
                let frames = node.frames();
                self.items.push(node);
                self.push_value(frames.to_string());
                Ok(())
            }
            "decap" => {
                let node = self.pop()?;
                if node.slot_count() > 0 {
                    for index in 0..node.slot_count() {
                        if let Some(upstream) = node.slot(index) {
                            self.items.push(upstream);
                        }
                    }
                } else {
                    self.items.push(node);
                }
                Ok(())
            }
            "slots?" => {
                let node = self.pop()?;
                let count = node.slot_count();
                self.items.push(node);
                self.push_value(count.to_string());
                Ok(())
            }
            "slot" => {
                let n = self.pop_index()?;
                let node = self.pop()?;
                let upstream = if n >= 0 { node.slot(n as usize) } else { None };
                self.items.push(node);
                match upstream {
                    Some(upstream) => {
                        self.items.push(upstream);
                        Ok(())
                    }
                    None => Err(Error::GraphConnection(format!(
                        "invalid slot index {n} for fetch"
                    ))),
                }
            }
            "connect" => {
                let n = self.pop_index()?;
                let upstream = self.pop()?;
                let target = self.pop()?;
                if n < 0 || n as usize >= target.slot_count() {
                    return Err(Error::GraphConnection(format!(
                        "invalid slot index {n} for connect"
                    )));
                }
                target.connect(upstream, n as usize);
                self.items.push(target);
                Ok(())
            }
            _ => unreachable!("operation table out of sync"),
        }
    }
}

fn is_operation(token: &str) -> bool {
    matches!(
        token,
        "+" | "-"
            | "*"
            | "/"
            | "drop"
            | "pick"
            | "roll"
            | "shift"
            | "depth?"
            | "length?"
            | "decap"
            | "slots?"
            | "slot"
            | "connect"
    )
}

fn is_numeric(token: &str) -> bool {
    let digits = token
        .strip_prefix(['+', '-'])
        .unwrap_or(token);
    !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit())
}

/// Normalise a numeric literal: strip a leading `+`, collapse `-0`.
fn normalize_numeric(token: &str) -> String {
    match token.strip_prefix('-') {
        Some(digits) if digits.bytes().all(|b| b == b'0') => digits.to_string(),
        Some(digits) => format!("-{digits}"),
        None => token.strip_prefix('+').unwrap_or(token).to_string(),
    }
}

/// Textual form of an arithmetic result: integral values print without a
/// decimal point, division by zero prints as `inf`.
fn format_number(value: f64) -> String {
    format!("{value}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stack() -> Stack {
        Stack::standard()
    }

    #[test]
    fn test_addition() {
        let mut s = stack();
        s.push("1 1 +").unwrap();
        assert_eq!(s.pop().unwrap().uri(), "2");
    }

    #[test]
    fn test_division_by_zero_is_inf() {
        let mut s = stack();
        s.push("1 0 /").unwrap();
        assert_eq!(s.pop().unwrap().uri(), "inf");
    }

    #[test]
    fn test_fractional_result() {
        let mut s = stack();
        s.push("1 2 /").unwrap();
        assert_eq!(s.pop().unwrap().uri(), "0.5");
    }

    #[test]
    fn test_depth_counts_before_its_own_push() {
        let mut s = stack();
        s.push("test: depth?").unwrap();
        assert_eq!(s.pop().unwrap().uri(), "1");
        assert_eq!(s.pop().unwrap().uri(), "test:");
    }

    #[test]
    fn test_numeric_normalisation() {
        let mut s = stack();
        s.push("+5").unwrap();
        assert_eq!(s.pop().unwrap().uri(), "5");
        s.push("-0").unwrap();
        assert_eq!(s.pop().unwrap().uri(), "0");
        s.push("-12").unwrap();
        assert_eq!(s.pop().unwrap().uri(), "-12");
    }

    #[test]
    fn test_dollar_literal() {
        let mut s = stack();
        s.push("$ drop").unwrap();
        assert_eq!(s.depth(), 1);
        assert_eq!(s.pop().unwrap().uri(), "drop");

        s.push(r#"$ "two words""#).unwrap();
        assert_eq!(s.pop().unwrap().uri(), "two words");
    }

    #[test]
    fn test_release_never_underflows() {
        let mut s = stack();
        assert!(s.release().unwrap().is_none());
        s.push("7").unwrap();
        assert_eq!(s.release().unwrap().unwrap().uri(), "7");
    }

    #[test]
    fn test_pop_underflow() {
        let mut s = stack();
        assert!(matches!(s.pop(), Err(Error::StackUnderflow)));
    }

    #[test]
    fn test_unresolved_token_fails_on_next_forcing_push() {
        let mut s = stack();
        s.push("nosuch:input").unwrap();
        assert_eq!(s.depth(), 1);
        // The next push forces resolution of the bad token.
        let error = s.push("1").unwrap_err();
        assert!(matches!(error, Error::UnresolvedToken(_)));
        // The failed token is gone; the stack behaves as before it.
        assert_eq!(s.depth(), 0);
        s.push("1").unwrap();
        assert_eq!(s.pop().unwrap().uri(), "1");
    }

    #[test]
    fn test_filter_binds_lazily() {
        let mut s = stack();
        s.push("test: filter:clip").unwrap();
        // Nothing bound yet.
        assert_eq!(s.depth(), 2);
        let clip = s.pop().unwrap();
        assert_eq!(clip.uri(), "clip");
        assert_eq!(clip.slot(0).unwrap().uri(), "test:");
        assert_eq!(s.depth(), 0);
    }

    #[test]
    fn test_filter_underflow_discards_consumed() {
        let mut s = stack();
        s.push("filter:clip").unwrap();
        assert!(matches!(s.pop(), Err(Error::GraphConnection(_))));
        assert_eq!(s.depth(), 0);
        assert!(matches!(s.pop(), Err(Error::StackUnderflow)));
    }

    #[test]
    fn test_property_assignment() {
        let mut s = stack();
        s.push("test: filter:clip in=10 out=60").unwrap();
        let clip = s.pop().unwrap();
        assert_eq!(clip.properties().get_i64("in"), Some(10));
        assert_eq!(clip.frames(), 50);
    }

    #[test]
    fn test_invalid_property_keeps_node() {
        let mut s = stack();
        s.push("test: filter:clip").unwrap();
        assert!(matches!(
            s.push("nosuch=1"),
            Err(Error::InvalidProperty { .. })
        ));
        assert!(matches!(
            s.push("in=rubbish"),
            Err(Error::InvalidProperty { .. })
        ));
        // The filter survives both failures.
        assert_eq!(s.pop().unwrap().uri(), "clip");
    }

    #[test]
    fn test_dynamic_property() {
        let mut s = stack();
        s.push("test: @note=hello").unwrap();
        let input = s.pop().unwrap();
        assert_eq!(
            input.properties().get("@note").unwrap().as_string(),
            "hello"
        );
    }

    #[test]
    fn test_percent_s_substitution() {
        let mut s = stack();
        s.push("test: 25 filter:clip out=%s").unwrap();
        let clip = s.pop().unwrap();
        assert_eq!(clip.properties().get_i64("out"), Some(25));
        // The scalar was consumed.
        assert_eq!(s.depth(), 0);
    }

    #[test]
    fn test_percent_s_right_to_left() {
        let mut s = stack();
        // Two placeholders: the rightmost takes the most recent push.
        s.push("1 2 test: @pair=%s-%s").unwrap();
        let input = s.pop().unwrap();
        assert_eq!(
            input.properties().get("@pair").unwrap().as_string(),
            "1-2"
        );
        assert_eq!(s.depth(), 0);
    }

    #[test]
    fn test_word_definition_and_invocation() {
        let mut s = stack();
        s.push(": double 2 * ;").unwrap();
        s.push("21 double").unwrap();
        assert_eq!(s.pop().unwrap().uri(), "42");
    }

    #[test]
    fn test_word_redefinition_affects_later_calls_only() {
        let mut s = stack();
        s.push(": colour 10 + ;").unwrap();
        s.push("1 colour").unwrap();
        s.push(": colour 10 - ;").unwrap();
        s.push("1 colour").unwrap();
        assert_eq!(s.pop().unwrap().uri(), "-9");
        assert_eq!(s.pop().unwrap().uri(), "11");
    }

    #[test]
    fn test_word_resolves_at_invocation_time() {
        let mut s = stack();
        s.push(": outer inner 1 + ;").unwrap();
        // `inner` doesn't exist yet; defining `outer` is fine.
        s.push(": inner 41 ;").unwrap();
        s.push("outer").unwrap();
        assert_eq!(s.pop().unwrap().uri(), "42");
    }

    #[test]
    fn test_unknown_word_use_and_forget() {
        let mut s = stack();
        assert!(matches!(s.push("forget ghost"), Err(Error::UnknownWord(_))));
        s.push(": ghost 1 ;").unwrap();
        s.push("forget ghost").unwrap();
        // Forgotten: the bare token now goes to the factory and fails on
        // the forcing pop.
        s.push("ghost").unwrap();
        assert!(matches!(s.pop(), Err(Error::UnresolvedToken(_))));
    }

    #[test]
    fn test_pick_shares_reference() {
        let mut s = stack();
        s.push("7 0 pick").unwrap();
        let a = s.pop().unwrap();
        let b = s.pop().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_roll_zero_is_noop() {
        let mut s = stack();
        s.push("1 2 3 0 roll").unwrap();
        assert_eq!(s.pop().unwrap().uri(), "3");
        assert_eq!(s.pop().unwrap().uri(), "2");
    }

    #[test]
    fn test_roll_moves_nth_to_top() {
        let mut s = stack();
        s.push("1 2 3 2 roll").unwrap();
        assert_eq!(s.pop().unwrap().uri(), "1");
        assert_eq!(s.pop().unwrap().uri(), "3");
        assert_eq!(s.pop().unwrap().uri(), "2");
    }

    #[test]
    fn test_shift_moves_top_down() {
        let mut s = stack();
        s.push("1 2 3 2 shift").unwrap();
        assert_eq!(s.pop().unwrap().uri(), "2");
        assert_eq!(s.pop().unwrap().uri(), "1");
        assert_eq!(s.pop().unwrap().uri(), "3");
    }

    #[test]
    fn test_manipulation_underflow() {
        let mut s = stack();
        assert!(matches!(s.push("drop"), Err(Error::StackUnderflow)));
        s.push("1").unwrap();
        assert!(matches!(s.push("5 pick"), Err(Error::StackUnderflow)));
        assert!(matches!(s.push("5 roll"), Err(Error::StackUnderflow)));
        assert!(matches!(s.push("5 shift"), Err(Error::StackUnderflow)));
    }

    #[test]
    fn test_decap_returns_slots() {
        let mut s = stack();
        s.push("test: filter:clip decap").unwrap();
        assert_eq!(s.depth(), 1);
        assert_eq!(s.pop().unwrap().uri(), "test:");
    }

    #[test]
    fn test_decap_on_input_is_noop() {
        let mut s = stack();
        s.push("test: decap").unwrap();
        assert_eq!(s.depth(), 1);
        assert_eq!(s.pop().unwrap().uri(), "test:");
    }

    #[test]
    fn test_length_syncs_and_pushes_count() {
        let mut s = stack();
        s.push("test: length?").unwrap();
        assert_eq!(s.pop().unwrap().uri(), "250");
        assert_eq!(s.pop().unwrap().uri(), "test:");
    }

    #[test]
    fn test_slots_and_slot() {
        let mut s = stack();
        s.push("test: filter:clip slots?").unwrap();
        assert_eq!(s.pop().unwrap().uri(), "1");
        s.push("0 slot").unwrap();
        assert_eq!(s.pop().unwrap().uri(), "test:");
        assert_eq!(s.pop().unwrap().uri(), "clip");
    }

    #[test]
    fn test_comments_are_ignored() {
        let mut s = stack();
        s.push("1 # 2 3 +\n1 +").unwrap();
        assert_eq!(s.pop().unwrap().uri(), "2");
    }

    #[test]
    fn test_unclosed_definition_blocks_pop() {
        let mut s = stack();
        s.push(": half 2 /").unwrap();
        assert!(matches!(s.pop(), Err(Error::Syntax(_))));
        s.push(";").unwrap();
        s.push("10 half").unwrap();
        assert_eq!(s.pop().unwrap().uri(), "5");
    }
}
