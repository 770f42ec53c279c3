//! Syscall filter compilation.
//!
//! The filter is expressed in seccompiler's JSON format so syscall names are
//! resolved against the target architecture's table by seccompiler itself.
//! Whitelist mode rejects everything not listed with
//! `errno(termination_exit_code)`; blacklist mode swaps the two actions.

use seccompiler::{BpfProgram, TargetArch};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::{SandboxError, DEFAULT_TERMINATION_EXIT_CODE};

const FILTER_NAME: &str = "workload";

/// Always allowed in whitelist mode so a rejected process can still exit.
const TERMINATION_SYSCALLS: &[&str] = &["exit", "exit_group", "rt_sigreturn"];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SeccompMode {
    #[default]
    Disabled,
    Whitelist,
    Blacklist,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeccompConfig {
    #[serde(default)]
    pub mode: SeccompMode,
    #[serde(default)]
    pub filter_items: Vec<FilterItem>,
    #[serde(default = "default_termination_exit_code")]
    pub termination_exit_code: u32,
}

fn default_termination_exit_code() -> u32 {
    DEFAULT_TERMINATION_EXIT_CODE
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterItem {
    pub syscall: String,
    #[serde(default)]
    pub conditions: Vec<FilterCondition>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionOperator {
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = "<")]
    Lt,
    /// `(arg & datum_a) == datum_b`
    #[serde(rename = "&=")]
    MaskedEq,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterCondition {
    pub argument: u8,
    pub operator: ConditionOperator,
    pub datum_a: u64,
    #[serde(default)]
    pub datum_b: u64,
}

impl FilterCondition {
    fn to_json(self) -> Result<Value, SandboxError> {
        if self.argument > 5 {
            return Err(SandboxError::ArgumentIndex {
                index: self.argument,
            });
        }

        let (op, val) = match self.operator {
            ConditionOperator::Eq => (json!("eq"), self.datum_a),
            ConditionOperator::Ne => (json!("ne"), self.datum_a),
            ConditionOperator::Ge => (json!("ge"), self.datum_a),
            ConditionOperator::Gt => (json!("gt"), self.datum_a),
            ConditionOperator::Le => (json!("le"), self.datum_a),
            ConditionOperator::Lt => (json!("lt"), self.datum_a),
            ConditionOperator::MaskedEq => (json!({ "masked_eq": self.datum_a }), self.datum_b),
        };

        Ok(json!({
            "index": self.argument,
            "type": "qword",
            "op": op,
            "val": val,
        }))
    }
}

enum RuleChain {
    Unconditional,
    Conditional(Vec<Vec<Value>>),
}

/// Group filter items by syscall name, keeping first-seen order.
///
/// An unconditional entry for a syscall absorbs any conditional ones, since
/// seccompiler would otherwise treat the merged chain as conditional only.
fn collect_rules(config: &SeccompConfig) -> Result<Vec<Value>, SandboxError> {
    let implicit: Vec<FilterItem> = match config.mode {
        SeccompMode::Whitelist => TERMINATION_SYSCALLS
            .iter()
            .map(|name| FilterItem {
                syscall: name.to_string(),
                conditions: Vec::new(),
            })
            .collect(),
        _ => Vec::new(),
    };

    let mut chains: Vec<(String, RuleChain)> = Vec::new();
    for item in implicit.iter().chain(config.filter_items.iter()) {
        let args = item
            .conditions
            .iter()
            .map(|c| c.to_json())
            .collect::<Result<Vec<_>, _>>()?;

        let index = match chains.iter().position(|(name, _)| *name == item.syscall) {
            Some(index) => index,
            None => {
                chains.push((item.syscall.clone(), RuleChain::Conditional(Vec::new())));
                chains.len() - 1
            }
        };

        let chain = &mut chains[index].1;
        if args.is_empty() {
            *chain = RuleChain::Unconditional;
        } else if let RuleChain::Conditional(rules) = chain {
            rules.push(args);
        }
    }

    let mut rules = Vec::new();
    for (syscall, chain) in chains {
        match chain {
            RuleChain::Unconditional => rules.push(json!({ "syscall": syscall })),
            RuleChain::Conditional(alternatives) => {
                for args in alternatives {
                    rules.push(json!({ "syscall": syscall, "args": args }));
                }
            }
        }
    }
    Ok(rules)
}

/// Compile the filter for the running architecture. `Ok(None)` when disabled.
pub(crate) fn compile(config: &SeccompConfig) -> Result<Option<BpfProgram>, SandboxError> {
    let reject = json!({ "errno": config.termination_exit_code });
    let (mismatch_action, filter_action) = match config.mode {
        SeccompMode::Disabled => return Ok(None),
        SeccompMode::Whitelist => (reject, json!("allow")),
        SeccompMode::Blacklist => (json!("allow"), reject),
    };

    let rules = collect_rules(config)?;
    debug!(mode = ?config.mode, rules = rules.len(), "Compiling seccomp filter");

    let document = json!({
        FILTER_NAME: {
            "mismatch_action": mismatch_action,
            "filter_action": filter_action,
            "filter": rules,
        }
    });

    let arch = std::env::consts::ARCH;
    let target = TargetArch::try_from(arch).map_err(|_| SandboxError::UnsupportedArch {
        arch: arch.to_string(),
    })?;

    let raw = serde_json::to_vec(&document).map_err(|e| SandboxError::FilterCompilation {
        message: e.to_string(),
    })?;
    let mut programs = seccompiler::compile_from_json(raw.as_slice(), target).map_err(|e| {
        SandboxError::FilterCompilation {
            message: e.to_string(),
        }
    })?;

    programs
        .remove(FILTER_NAME)
        .map(Some)
        .ok_or_else(|| SandboxError::FilterCompilation {
            message: "compiled filter missing from output".to_string(),
        })
}

pub(crate) fn install(program: &BpfProgram) -> Result<(), SandboxError> {
    seccompiler::apply_filter(program).map_err(|source| SandboxError::FilterLoad { source })
}
