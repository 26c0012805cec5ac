//! Right-hand-side functions.
//!
//! A production action may call a named function, either as a value inside a
//! make action or as a standalone action run for its side effects. Functions
//! live in an [`RhsFunctions`] registry keyed by name. They see the symbol
//! table and can queue [`RhsEffect`]s (printing, halting, interrupting, extra
//! preferences) that the kernel applies once the firing completes.

use std::collections::HashMap;
use std::fmt;

use crate::error::RhsError;
use crate::symbol::{SymbolId, SymbolTable, SymbolValue};

/// Something a function asked the kernel to do after the firing.
#[derive(Debug, Clone, PartialEq)]
pub enum RhsEffect {
    /// Text for the print stream.
    Write(String),
    Halt,
    Interrupt,
    /// An extra preference, of the calling action's type.
    AddWme {
        id: SymbolId,
        attr: SymbolId,
        value: SymbolId,
    },
}

/// What a function can see and do while it runs.
pub struct RhsContext<'a> {
    pub symbols: &'a mut SymbolTable,
    /// Name of the production being fired.
    pub production: &'a str,
    pub(crate) effects: &'a mut Vec<RhsEffect>,
}

impl<'a> RhsContext<'a> {
    pub fn new(
        symbols: &'a mut SymbolTable,
        production: &'a str,
        effects: &'a mut Vec<RhsEffect>,
    ) -> Self {
        Self {
            symbols,
            production,
            effects,
        }
    }

    pub fn write(&mut self, text: impl Into<String>) {
        self.effects.push(RhsEffect::Write(text.into()));
    }

    pub fn halt(&mut self) {
        self.effects.push(RhsEffect::Halt);
    }

    pub fn interrupt(&mut self) {
        self.effects.push(RhsEffect::Interrupt);
    }

    /// Queue a preference `(id ^attr value)` with the calling action's type.
    pub fn add_wme(&mut self, id: SymbolId, attr: SymbolId, value: SymbolId) {
        self.effects.push(RhsEffect::AddWme { id, attr, value });
    }
}

/// Signature of a right-hand-side function. `Ok(None)` means the call
/// produced no value.
pub type RhsHandler =
    dyn Fn(&mut RhsContext<'_>, &[SymbolId]) -> Result<Option<SymbolId>, RhsError> + Send + Sync;

struct RhsFunction {
    min_args: usize,
    max_args: Option<usize>,
    handler: Box<RhsHandler>,
}

/// Registry of right-hand-side functions.
pub struct RhsFunctions {
    functions: HashMap<String, RhsFunction>,
}

impl fmt::Debug for RhsFunctions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&str> = self.functions.keys().map(String::as_str).collect();
        names.sort_unstable();
        f.debug_struct("RhsFunctions").field("functions", &names).finish()
    }
}

impl Default for RhsFunctions {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl RhsFunctions {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            functions: HashMap::new(),
        }
    }

    /// A registry holding the built-in functions.
    pub fn with_builtins() -> Self {
        let mut r = Self::new();
        r.register("+", 0, None, |ctx, args| {
            fold_numbers(ctx, "+", args, Number::Int(0), Number::add).map(Some)
        });
        r.register("*", 0, None, |ctx, args| {
            fold_numbers(ctx, "*", args, Number::Int(1), Number::mul).map(Some)
        });
        r.register("-", 1, None, |ctx, args| {
            let first = number(ctx.symbols, "-", args[0])?;
            let result = if args.len() == 1 {
                Number::Int(0).sub(first)
            } else {
                let mut acc = first;
                for &a in &args[1..] {
                    acc = acc.sub(number(ctx.symbols, "-", a)?);
                }
                acc
            };
            Ok(Some(result.intern(ctx.symbols)))
        });
        r.register("/", 1, None, |ctx, args| {
            let first = number(ctx.symbols, "/", args[0])?.as_f64();
            let (mut acc, rest) = if args.len() == 1 {
                (1.0, &args[..])
            } else {
                (first, &args[1..])
            };
            for &a in rest {
                let d = number(ctx.symbols, "/", a)?.as_f64();
                if d == 0.0 {
                    return Err(failed("/", "attempt to divide by zero"));
                }
                acc /= d;
            }
            Ok(Some(ctx.symbols.intern_float(acc)))
        });
        r.register("concat", 0, None, |ctx, args| {
            let text: String = args.iter().map(|&a| ctx.symbols.display(a)).collect();
            Ok(Some(ctx.symbols.intern_str(&text)))
        });
        r.register("write", 0, None, |ctx, args| {
            let text: String = args.iter().map(|&a| ctx.symbols.display(a)).collect();
            ctx.write(text);
            Ok(None)
        });
        r.register("crlf", 0, Some(0), |ctx, _| Ok(Some(ctx.symbols.intern_str("\n"))));
        r.register("halt", 0, Some(0), |ctx, _| {
            ctx.halt();
            Ok(None)
        });
        r.register("interrupt", 0, Some(0), |ctx, _| {
            ctx.interrupt();
            Ok(None)
        });
        r.register("make-constant-symbol", 0, Some(1), |ctx, args| {
            let prefix = match args.first() {
                Some(&a) => ctx.symbols.display(a),
                None => "constant".to_string(),
            };
            let mut n = 1u64;
            loop {
                let candidate = format!("{prefix}{n}");
                if ctx.symbols.find_str(&candidate).is_none() {
                    return Ok(Some(ctx.symbols.intern_str(&candidate)));
                }
                n += 1;
            }
        });
        r.register("int", 1, Some(1), |ctx, args| {
            let v = match ctx.symbols.value(args[0]) {
                Some(SymbolValue::Int(i)) => *i,
                Some(SymbolValue::Float(x)) => *x as i64,
                Some(SymbolValue::Str(s)) => s
                    .trim()
                    .parse::<i64>()
                    .or_else(|_| s.trim().parse::<f64>().map(|x| x as i64))
                    .map_err(|_| failed("int", format!("'{s}' is not a number")))?,
                _ => {
                    let shown = ctx.symbols.display(args[0]);
                    return Err(failed("int", format!("'{shown}' is not a number")));
                }
            };
            Ok(Some(ctx.symbols.intern_int(v)))
        });
        r.register("float", 1, Some(1), |ctx, args| {
            let v = match ctx.symbols.value(args[0]) {
                Some(SymbolValue::Int(i)) => *i as f64,
                Some(SymbolValue::Float(x)) => *x,
                Some(SymbolValue::Str(s)) => s
                    .trim()
                    .parse::<f64>()
                    .map_err(|_| failed("float", format!("'{s}' is not a number")))?,
                _ => {
                    let shown = ctx.symbols.display(args[0]);
                    return Err(failed("float", format!("'{shown}' is not a number")));
                }
            };
            Ok(Some(ctx.symbols.intern_float(v)))
        });
        r
    }

    /// Register (or replace) a function. `max_args` of `None` means variadic.
    pub fn register<F>(
        &mut self,
        name: impl Into<String>,
        min_args: usize,
        max_args: Option<usize>,
        f: F,
    ) where
        F: Fn(&mut RhsContext<'_>, &[SymbolId]) -> Result<Option<SymbolId>, RhsError>
            + Send
            + Sync
            + 'static,
    {
        self.functions.insert(
            name.into(),
            RhsFunction {
                min_args,
                max_args,
                handler: Box::new(f),
            },
        );
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    /// Check arity and run a function.
    pub fn call(
        &self,
        name: &str,
        ctx: &mut RhsContext<'_>,
        args: &[SymbolId],
    ) -> Result<Option<SymbolId>, RhsError> {
        let f = self
            .functions
            .get(name)
            .ok_or_else(|| RhsError::UnknownFunction {
                name: name.to_string(),
            })?;
        let too_many = f.max_args.is_some_and(|max| args.len() > max);
        if args.len() < f.min_args || too_many {
            return Err(RhsError::Arity {
                name: name.to_string(),
                expected: if too_many {
                    f.max_args.unwrap_or(f.min_args)
                } else {
                    f.min_args
                },
                actual: args.len(),
            });
        }
        (f.handler)(ctx, args)
    }
}

fn failed(name: &str, message: impl Into<String>) -> RhsError {
    RhsError::FunctionFailed {
        name: name.to_string(),
        message: message.into(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Number {
    Int(i64),
    Float(f64),
}

impl Number {
    fn as_f64(self) -> f64 {
        match self {
            Number::Int(i) => i as f64,
            Number::Float(x) => x,
        }
    }

    fn combine(
        self,
        other: Number,
        int: fn(i64, i64) -> Option<i64>,
        float: fn(f64, f64) -> f64,
    ) -> Number {
        match (self, other) {
            (Number::Int(a), Number::Int(b)) => match int(a, b) {
                Some(v) => Number::Int(v),
                None => Number::Float(float(a as f64, b as f64)),
            },
            (a, b) => Number::Float(float(a.as_f64(), b.as_f64())),
        }
    }

    fn add(self, other: Number) -> Number {
        self.combine(other, i64::checked_add, |a, b| a + b)
    }

    fn sub(self, other: Number) -> Number {
        self.combine(other, i64::checked_sub, |a, b| a - b)
    }

    fn mul(self, other: Number) -> Number {
        self.combine(other, i64::checked_mul, |a, b| a * b)
    }

    fn intern(self, symbols: &mut SymbolTable) -> SymbolId {
        match self {
            Number::Int(i) => symbols.intern_int(i),
            Number::Float(x) => symbols.intern_float(x),
        }
    }
}

fn number(symbols: &SymbolTable, name: &str, sym: SymbolId) -> Result<Number, RhsError> {
    match symbols.value(sym) {
        Some(SymbolValue::Int(i)) => Ok(Number::Int(*i)),
        Some(SymbolValue::Float(x)) => Ok(Number::Float(*x)),
        _ => Err(failed(
            name,
            format!("non-number ({}) passed to '{name}'", symbols.display(sym)),
        )),
    }
}

fn fold_numbers(
    ctx: &mut RhsContext<'_>,
    name: &str,
    args: &[SymbolId],
    init: Number,
    op: fn(Number, Number) -> Number,
) -> Result<SymbolId, RhsError> {
    let mut acc = init;
    for &a in args {
        acc = op(acc, number(ctx.symbols, name, a)?);
    }
    Ok(acc.intern(ctx.symbols))
}

/// Bindings of right-hand-side-only variables during one firing.
///
/// Each such variable gets one fresh identifier per firing, shared by every
/// action that mentions it.
#[derive(Debug, Clone, Default)]
pub struct RhsBindings {
    slots: Vec<Option<SymbolId>>,
}

impl RhsBindings {
    pub fn new(count: usize) -> Self {
        Self {
            slots: vec![None; count],
        }
    }

    pub fn lookup(&self, index: usize) -> Option<SymbolId> {
        self.slots.get(index).copied().flatten()
    }

    pub fn set(&mut self, index: usize, sym: SymbolId) {
        if index >= self.slots.len() {
            self.slots.resize(index + 1, None);
        }
        self.slots[index] = Some(sym);
    }
}
