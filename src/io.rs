//! Input and output at the phase boundaries.
//!
//! The top state carries `(S1 ^io I1) (I1 ^input-link I2) (I1 ^output-link I3)`.
//! Before each proposal the [`IoHooks::on_input`] callback may add or remove
//! input WMEs; after each application [`IoHooks::on_output`] sees the WMEs
//! committed during the cycle and whether anything under the output link
//! changed.

use std::collections::HashSet;

use crate::error::{KernelResult, SymbolError};
use crate::kernel::Kernel;
use crate::memory::{WmeFacts, WmeId};
use crate::symbol::{SymbolId, TOP_GOAL_LEVEL};

/// Callbacks for the environment an agent runs in.
pub trait IoHooks {
    /// Called in the input phase.
    fn on_input(&mut self, _input: &mut InputContext<'_>) -> KernelResult<()> {
        Ok(())
    }

    /// Called in the output phase.
    fn on_output(&mut self, _output: &OutputContext<'_>) {}
}

/// Hooks that do nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoIo;

impl IoHooks for NoIo {}

/// Io link identifiers and the WM changes seen since the last output phase.
#[derive(Debug, Default)]
pub struct IoState {
    pub io_header: Option<SymbolId>,
    pub input_link: Option<SymbolId>,
    pub output_link: Option<SymbolId>,
    pub output_link_changed: bool,
    pub(crate) additions: Vec<WmeFacts>,
    pub(crate) removals: Vec<WmeFacts>,
    /// Identifiers under the output link at the last output phase.
    output_ids: HashSet<SymbolId>,
}

impl IoState {
    pub(crate) fn clear(&mut self) {
        *self = Self::default();
    }

    pub(crate) fn record_commit(&mut self, added: Vec<WmeFacts>, removed: Vec<WmeFacts>) {
        self.additions.extend(added);
        self.removals.extend(removed);
    }
}

/// What an input callback may do.
pub struct InputContext<'a> {
    kernel: &'a mut Kernel,
}

impl InputContext<'_> {
    pub fn input_link(&self) -> Option<SymbolId> {
        self.kernel.io_state.input_link
    }

    pub fn intern_str(&mut self, s: &str) -> SymbolId {
        self.kernel.symbols.intern_str(s)
    }

    pub fn intern_int(&mut self, v: i64) -> SymbolId {
        self.kernel.symbols.intern_int(v)
    }

    pub fn intern_float(&mut self, v: f64) -> SymbolId {
        self.kernel.symbols.intern_float(v)
    }

    /// A fresh identifier at the top level, for input structure.
    pub fn new_identifier(&mut self, letter: char) -> SymbolId {
        self.kernel.symbols.new_identifier(letter, TOP_GOAL_LEVEL)
    }

    pub fn add_wme(
        &mut self,
        id: SymbolId,
        attr: SymbolId,
        value: SymbolId,
    ) -> KernelResult<WmeId> {
        self.kernel.add_input_wme(id, attr, value)
    }

    pub fn remove_wme(&mut self, w: WmeId) -> KernelResult<()> {
        self.kernel.remove_input_wme(w)
    }

    /// Read-only access to the rest of the kernel.
    pub fn kernel(&self) -> &Kernel {
        self.kernel
    }
}

/// What an output callback sees.
pub struct OutputContext<'a> {
    pub kernel: &'a Kernel,
    pub output_link: Option<SymbolId>,
    /// WMEs added under the output link since the last output phase.
    pub additions: Vec<WmeFacts>,
    /// WMEs removed under the output link since the last output phase.
    pub removals: Vec<WmeFacts>,
    pub output_link_changed: bool,
}

impl Kernel {
    /// Add a WME from the environment. It has no supporting preference and
    /// stays until removed with [`Kernel::remove_input_wme`].
    pub fn add_input_wme(
        &mut self,
        id: SymbolId,
        attr: SymbolId,
        value: SymbolId,
    ) -> KernelResult<WmeId> {
        if !self.symbols.is_identifier(id) {
            return Err(SymbolError::NotAnIdentifier {
                symbol: self.symbols.display(id),
            }
            .into());
        }
        let w = self.wm.make_wme(id, attr, value, false);
        if let Some(info) = self.symbols.ident_mut(id) {
            info.input_wmes.push(w);
        }
        self.add_wme_to_wm(w);
        Ok(w)
    }

    /// Remove an input WME. Unknown or already removed WMEs are ignored. A
    /// WME in the dependency set of a live goal takes that goal with it.
    pub fn remove_input_wme(&mut self, w: WmeId) -> KernelResult<()> {
        let Some(wme) = self.wm.get(w) else {
            return Ok(());
        };
        let id = wme.id;
        if let Some(info) = self.symbols.ident_mut(id) {
            info.input_wmes.retain(|&x| x != w);
        }
        self.gds_invalid_so_remove_goal(w)?;
        self.remove_wme_from_wm(w);
        Ok(())
    }

    /// Build the `^io` structure on the top state.
    pub(crate) fn create_io_link(&mut self) -> KernelResult<()> {
        let Some(top) = self.decider.top_goal else {
            return Ok(());
        };
        let (io, input_link, output_link) = (
            self.predefined.io,
            self.predefined.input_link,
            self.predefined.output_link,
        );
        let header = self.symbols.new_identifier('I', TOP_GOAL_LEVEL);
        self.add_input_wme(top, io, header)?;
        let input = self.symbols.new_identifier('I', TOP_GOAL_LEVEL);
        self.add_input_wme(header, input_link, input)?;
        let output = self.symbols.new_identifier('I', TOP_GOAL_LEVEL);
        self.add_input_wme(header, output_link, output)?;
        self.io_state.io_header = Some(header);
        self.io_state.input_link = Some(input);
        self.io_state.output_link = Some(output);
        tracing::debug!(
            input = %self.symbols.display(input),
            output = %self.symbols.display(output),
            "created io link"
        );
        Ok(())
    }

    /// Run the input callback and commit what it changed.
    pub(crate) fn do_input_cycle(&mut self) -> KernelResult<()> {
        let mut hooks = std::mem::replace(&mut self.io, Box::new(NoIo));
        let result = {
            let mut ctx = InputContext { kernel: self };
            hooks.on_input(&mut ctx)
        };
        self.io = hooks;
        result?;
        self.do_buffered_wm_and_ownership_changes()
    }

    /// Identifiers reachable from the output link through working memory.
    fn output_link_closure(&self) -> HashSet<SymbolId> {
        let mut seen = HashSet::new();
        let Some(root) = self.io_state.output_link else {
            return seen;
        };
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            for (_, w) in self.wm.iter().filter(|(_, w)| w.id == id) {
                if self.symbols.is_identifier(w.value) && !self.symbols.is_goal(w.value) {
                    stack.push(w.value);
                }
            }
        }
        seen
    }

    /// Report output-link changes to the output callback. Returns whether
    /// the output link changed.
    pub(crate) fn do_output_cycle(&mut self) -> KernelResult<bool> {
        let closure = self.output_link_closure();
        let additions: Vec<WmeFacts> = std::mem::take(&mut self.io_state.additions)
            .into_iter()
            .filter(|f| closure.contains(&f.id))
            .collect();
        let removals: Vec<WmeFacts> = std::mem::take(&mut self.io_state.removals)
            .into_iter()
            .filter(|f| closure.contains(&f.id) || self.io_state.output_ids.contains(&f.id))
            .collect();
        let changed = !additions.is_empty() || !removals.is_empty();
        self.io_state.output_link_changed = changed;
        self.io_state.output_ids = closure;
        if changed {
            tracing::debug!(
                added = additions.len(),
                removed = removals.len(),
                "output link changed"
            );
        }

        let mut hooks = std::mem::replace(&mut self.io, Box::new(NoIo));
        {
            let ctx = OutputContext {
                kernel: self,
                output_link: self.io_state.output_link,
                additions,
                removals,
                output_link_changed: changed,
            };
            hooks.on_output(&ctx);
        }
        self.io = hooks;
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cycle::RunType;
    use crate::kernel::KernelConfig;
    use crate::memory::PreferenceType;
    use crate::production::{DeclaredSupport, ProductionBuilder};
    use std::sync::{Arc, Mutex};

    #[test]
    fn top_state_has_io_structure() {
        let k = Kernel::new(KernelConfig::default()).unwrap();
        let top = k.top_goal().unwrap();
        let header = k.io_state.io_header.unwrap();
        assert!(k.wm.find(top, k.predefined.io, header).is_some());
        let input = k.io_state.input_link.unwrap();
        assert!(k.wm.find(header, k.predefined.input_link, input).is_some());
        assert_eq!(k.symbols.level(input), TOP_GOAL_LEVEL);
    }

    #[test]
    fn removing_a_gds_input_wme_removes_the_goal() {
        let mut k = Kernel::new(KernelConfig::default()).unwrap();
        let top = k.top_goal().unwrap();
        for name in ["a", "b"] {
            k.add_production(
                ProductionBuilder::new(format!("propose*{name}"))
                    .state("<s>", "superstate", "nil")
                    .make("<s>", "operator", "<o>", PreferenceType::Acceptable)
                    .make("<o>", "name", name, PreferenceType::Acceptable),
            )
            .unwrap();
        }
        k.add_production(
            ProductionBuilder::new("sub*mark")
                .support(DeclaredSupport::OSupport)
                .state("<s>", "impasse", "tie")
                .cond("<s>", "superstate", "<ss>")
                .cond("<ss>", "switch", "on")
                .make("<s>", "marked", "yes", PreferenceType::Acceptable),
        )
        .unwrap();
        let (switch, on) = (k.symbols.intern_str("switch"), k.symbols.intern_str("on"));
        let w = k.add_input_wme(top, switch, on).unwrap();
        k.run(1, RunType::Decisions).unwrap();
        let sub = k.goal_stack()[1];
        assert_eq!(k.attribute_values(sub, "marked").len(), 1);
        assert!(k.symbols.goal(sub).and_then(|g| g.gds).is_some());
        assert!(k.wm[w].gds.is_some());

        k.remove_input_wme(w).unwrap();
        assert_eq!(k.goal_stack(), vec![top]);
    }

    #[test]
    fn input_wmes_need_an_identifier() {
        let mut k = Kernel::new(KernelConfig::default()).unwrap();
        let x = k.symbols.intern_str("x");
        assert!(k.add_input_wme(x, x, x).is_err());
    }

    struct Sensor {
        seen_output: Arc<Mutex<Vec<String>>>,
    }

    impl IoHooks for Sensor {
        fn on_input(&mut self, input: &mut InputContext<'_>) -> KernelResult<()> {
            let Some(link) = input.input_link() else {
                return Ok(());
            };
            if input.kernel().symbols.ident(link).is_some_and(|i| i.input_wmes.is_empty()) {
                let attr = input.intern_str("light");
                let value = input.intern_str("green");
                input.add_wme(link, attr, value)?;
            }
            Ok(())
        }

        fn on_output(&mut self, output: &OutputContext<'_>) {
            let mut seen = self.seen_output.lock().unwrap();
            for f in &output.additions {
                seen.push(output.kernel.symbols.display(f.attr));
            }
        }
    }

    #[test]
    fn input_reaches_productions_and_output_is_reported() {
        let seen_output = Arc::new(Mutex::new(Vec::new()));
        let mut k = Kernel::new(KernelConfig::default()).unwrap();
        k.set_io_hooks(Box::new(Sensor {
            seen_output: Arc::clone(&seen_output),
        }));
        k.add_production(
            ProductionBuilder::new("go")
                .support(DeclaredSupport::OSupport)
                .state("<s>", "io", "<io>")
                .cond("<io>", "input-link", "<in>")
                .cond("<in>", "light", "green")
                .cond("<io>", "output-link", "<out>")
                .make("<out>", "move", "forward", PreferenceType::Acceptable),
        )
        .unwrap();
        k.run(1, RunType::Decisions).unwrap();
        assert!(k.io_state.output_link_changed);
        assert_eq!(*seen_output.lock().unwrap(), vec!["move".to_string()]);

        k.run(1, RunType::Decisions).unwrap();
        assert!(!k.io_state.output_link_changed);
    }
}
