//! The dynamic-environment stack.
//!
//! An ordered stack of entries describing the current dynamic extent:
//! winders (wind/unwind thunk pairs), prompts (delimiters that aborts
//! target and partial captures are cut at), and non-rewindable barriers
//! (pushed by `call_with_vm` when it installs a different VM). The
//! execution core drives this stack during capture, reinstatement and
//! abort; entries themselves are passive data.
//!
//! Entries are shared (`Rc`) so a captured handle is a cheap clone whose
//! identity survives in the live stack, which is what lets a full
//! continuation rewind find the common prefix.

use std::rc::Rc;

use bitflags::bitflags;

use crate::program::CodePtr;
use crate::value::Value;

bitflags! {
    /// Prompt behavior flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PromptFlags: u8 {
        /// The prompt only supports escaping; a continuation captured at
        /// an abort to it cannot be reinstated.
        const ESCAPE_ONLY = 1 << 0;
    }
}

/// A prompt on the dynamic stack: a named delimiter with the cursors and
/// engine registers needed to resume at its handler.
#[derive(Debug, Clone)]
pub struct PromptEntry {
    /// The tag aborts match against, compared with `eqv`.
    pub tag: Value,
    /// Frame pointer at prompt establishment.
    pub fp: usize,
    /// Stack pointer at prompt establishment.
    pub sp: usize,
    /// Handler address within the establishing procedure.
    pub handler: CodePtr,
    /// Identity of the engine invocation whose dispatch loop resumes the
    /// handler (the saved jump buffer, in the original's terms).
    pub registers: u64,
    pub flags: PromptFlags,
}

impl PromptEntry {
    /// A copy of this prompt with its cursors shifted by `reloc` and a
    /// fresh registers handle, for re-establishment during rewinding.
    pub fn rewound(&self, reloc: isize, registers: u64) -> PromptEntry {
        PromptEntry {
            tag: self.tag.clone(),
            fp: (self.fp as isize + reloc) as usize,
            sp: (self.sp as isize + reloc) as usize,
            handler: self.handler.clone(),
            registers,
            flags: self.flags,
        }
    }
}

/// One dynamic-stack entry.
#[derive(Debug)]
pub enum DynEntry {
    /// A wind/unwind thunk pair. The wind effect runs whenever control
    /// enters the extent (including continuation rewinding), the unwind
    /// effect whenever control leaves it.
    Winder { wind: Value, unwind: Value },
    /// A delimiter for abort and partial capture.
    Prompt(PromptEntry),
    /// An extent that refuses rewinding; `vm_id` names the VM installed
    /// when the barrier was created.
    Barrier { vm_id: u64 },
}

/// A captured run of dynamic-stack entries, in capture order.
#[derive(Debug, Clone, Default)]
pub struct DynCapture {
    entries: Vec<Rc<DynEntry>>,
}

impl DynCapture {
    /// Walk the captured entries bottom-up (capture order).
    pub fn iter(&self) -> impl Iterator<Item = &Rc<DynEntry>> {
        self.entries.iter()
    }

    /// Number of captured entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing was captured.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True if any captured entry is a non-rewindable barrier.
    pub fn has_barrier(&self) -> bool {
        self.entries
            .iter()
            .any(|e| matches!(**e, DynEntry::Barrier { .. }))
    }

    pub(crate) fn entries(&self) -> &[Rc<DynEntry>] {
        &self.entries
    }
}

/// The live dynamic-environment stack of one VM.
#[derive(Debug, Default)]
pub struct DynStack {
    entries: Vec<Rc<DynEntry>>,
}

impl DynStack {
    pub fn new() -> Self {
        DynStack::default()
    }

    /// Current depth.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no dynamic extent is in effect.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Push a winder.
    pub fn push_winder(&mut self, wind: Value, unwind: Value) {
        self.entries.push(Rc::new(DynEntry::Winder { wind, unwind }));
    }

    /// Push a prompt.
    pub fn push_prompt(&mut self, prompt: PromptEntry) {
        self.entries.push(Rc::new(DynEntry::Prompt(prompt)));
    }

    /// Push a non-rewindable barrier.
    pub fn push_barrier(&mut self, vm_id: u64) {
        self.entries.push(Rc::new(DynEntry::Barrier { vm_id }));
    }

    pub(crate) fn push_entry(&mut self, entry: Rc<DynEntry>) {
        self.entries.push(entry);
    }

    /// Pop the top entry, if any.
    pub fn pop(&mut self) -> Option<Rc<DynEntry>> {
        self.entries.pop()
    }

    /// The top entry, if any.
    pub fn top(&self) -> Option<&Rc<DynEntry>> {
        self.entries.last()
    }

    /// The entry at depth `idx` (0 = bottom).
    pub fn get(&self, idx: usize) -> Option<&Rc<DynEntry>> {
        self.entries.get(idx)
    }

    /// Find the topmost prompt whose tag is `eqv` to `tag`.
    pub fn find_prompt(&self, tag: &Value) -> Option<(usize, &PromptEntry)> {
        for (idx, entry) in self.entries.iter().enumerate().rev() {
            if let DynEntry::Prompt(prompt) = &**entry {
                if prompt.tag.eqv(tag) {
                    return Some((idx, prompt));
                }
            }
        }
        None
    }

    /// Capture the whole current extent.
    pub fn capture_all(&self) -> DynCapture {
        DynCapture {
            entries: self.entries.clone(),
        }
    }

    /// Capture the slice strictly above the entry at `idx`.
    pub fn capture_above(&self, idx: usize) -> DynCapture {
        DynCapture {
            entries: self.entries[idx + 1..].to_vec(),
        }
    }

    /// Length of the prefix shared (by entry identity) with `capture`.
    pub(crate) fn common_prefix(&self, capture: &DynCapture) -> usize {
        self.entries
            .iter()
            .zip(capture.entries())
            .take_while(|(live, captured)| Rc::ptr_eq(live, captured))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::program::CodeBlock;

    fn prompt(tag: Value, registers: u64) -> PromptEntry {
        let code = CodeBlock::new(None, vec![0], vec![]);
        PromptEntry {
            tag,
            fp: 4,
            sp: 7,
            handler: CodePtr::at(code, 0),
            registers,
            flags: PromptFlags::empty(),
        }
    }

    #[test]
    fn test_find_prompt_topmost_match() {
        let tag = Value::symbol("t");
        let mut stack = DynStack::new();
        stack.push_prompt(prompt(tag.clone(), 1));
        stack.push_winder(Value::Bool(false), Value::Bool(false));
        stack.push_prompt(prompt(tag.clone(), 2));

        let (idx, found) = stack.find_prompt(&tag).unwrap();
        assert_eq!(idx, 2);
        assert_eq!(found.registers, 2);
        assert!(stack.find_prompt(&Value::symbol("other")).is_none());
    }

    #[test]
    fn test_capture_above_in_capture_order() {
        let tag = Value::symbol("t");
        let mut stack = DynStack::new();
        stack.push_prompt(prompt(tag.clone(), 1));
        stack.push_winder(Value::Int(1), Value::Int(2));
        stack.push_barrier(9);

        let (idx, _) = stack.find_prompt(&tag).unwrap();
        let capture = stack.capture_above(idx);
        assert_eq!(capture.len(), 2);
        assert!(capture.has_barrier());
        let kinds: Vec<_> = capture
            .iter()
            .map(|e| match &**e {
                DynEntry::Winder { .. } => "winder",
                DynEntry::Prompt(_) => "prompt",
                DynEntry::Barrier { .. } => "barrier",
            })
            .collect();
        assert_eq!(kinds, vec!["winder", "barrier"]);
    }

    #[test]
    fn test_common_prefix_by_identity() {
        let mut stack = DynStack::new();
        stack.push_winder(Value::Int(1), Value::Int(2));
        stack.push_winder(Value::Int(3), Value::Int(4));
        let capture = stack.capture_all();

        stack.pop();
        stack.push_winder(Value::Int(3), Value::Int(4));
        // Same content, different entry identity: only the bottom matches.
        assert_eq!(stack.common_prefix(&capture), 1);
    }

    #[test]
    fn test_rewound_prompt_relocates_cursors() {
        let p = prompt(Value::symbol("t"), 1);
        let moved = p.rewound(10, 5);
        assert_eq!(moved.fp, 14);
        assert_eq!(moved.sp, 17);
        assert_eq!(moved.registers, 5);
    }
}
