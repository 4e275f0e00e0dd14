//! # Scripted guest engine
//!
//! A deterministic engine implementation used by the test suite; real
//! embeddings supply their own. "Guest code" is a line-oriented script:
//!
//! ```text
//! def main
//!   dispatch testOp test
//! end
//! main()
//! ```
//!
//! Statements: `dispatch <cap> <payload>` invokes a named capability and
//! records the response, `dispatchraw <cap> <payload> <raw>` attaches a
//! zero-copy buffer, `call <name>` / `<name>()` runs a defined procedure,
//! and `spawn <name>` queues a procedure for the drain phase. Snapshots
//! serialize the defined procedures, so a restored context can run them
//! without re-evaluating their defining script.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Mutex;

use anyhow::Context;
use anyhow::anyhow;
use anyhow::bail;
use futures::future::BoxFuture;
use serde::Deserialize;
use serde::Serialize;

use crate::engine::CapabilityTable;
use crate::engine::GuestConfig;
use crate::engine::GuestEngine;
use crate::engine::GuestInstance;
use crate::engine::ModuleProvider;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum Stmt {
    Dispatch { cap: String, payload: String, raw: Option<String> },
    Call(String),
    Spawn(String),
}

/// Observable record of what guest contexts saw, shared by every instance
/// the engine creates.
#[derive(Clone, Default)]
pub struct GuestLog {
    entries: Arc<Mutex<Vec<String>>>,
}

impl GuestLog {
    pub fn entries(&self) -> Vec<String> {
        match self.entries.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn push(&self, entry: String) {
        match self.entries.lock() {
            Ok(mut guard) => guard.push(entry),
            Err(poisoned) => poisoned.into_inner().push(entry),
        }
    }
}

/// Engine driving scripted guests.
#[derive(Default)]
pub struct ScriptedEngine {
    log: GuestLog,
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// The log instances append dispatch responses to.
    pub fn log(&self) -> GuestLog {
        self.log.clone()
    }
}

impl GuestEngine for ScriptedEngine {
    fn instantiate(
        &self,
        config: GuestConfig,
        caps: Arc<CapabilityTable>,
    ) -> anyhow::Result<Box<dyn GuestInstance>> {
        let procedures = match config.snapshot {
            Some(bytes) => serde_json::from_slice(&bytes).context("invalid snapshot blob")?,
            None => HashMap::new(),
        };
        Ok(Box::new(ScriptedInstance {
            procedures,
            deferred: VecDeque::new(),
            caps,
            log: self.log.clone(),
        }))
    }
}

struct ScriptedInstance {
    procedures: HashMap<String, Vec<Stmt>>,
    deferred: VecDeque<String>,
    caps: Arc<CapabilityTable>,
    log: GuestLog,
}

impl ScriptedInstance {
    fn run_block<'a>(&'a mut self, stmts: Vec<Stmt>) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            for stmt in stmts {
                match stmt {
                    Stmt::Dispatch { cap, payload, raw } => {
                        let response = self
                            .caps
                            .dispatch_named(
                                &cap,
                                payload.as_bytes(),
                                raw.as_deref().map(str::as_bytes),
                            )
                            .await?;
                        self.log
                            .push(format!("{cap} -> {}", String::from_utf8_lossy(&response)));
                    }
                    Stmt::Call(name) => {
                        let body = self
                            .procedures
                            .get(&name)
                            .cloned()
                            .ok_or_else(|| anyhow!("undefined procedure '{name}'"))?;
                        self.run_block(body).await?;
                    }
                    Stmt::Spawn(name) => self.deferred.push_back(name),
                }
            }
            Ok(())
        })
    }
}

#[async_trait::async_trait]
impl GuestInstance for ScriptedInstance {
    async fn evaluate(&mut self, filename: &str, source: &str) -> anyhow::Result<()> {
        let (procedures, top_level) =
            parse(source).with_context(|| format!("in {filename}"))?;
        self.procedures.extend(procedures);
        self.run_block(top_level).await
    }

    async fn evaluate_module(
        &mut self,
        specifier: &str,
        modules: Arc<dyn ModuleProvider>,
    ) -> anyhow::Result<()> {
        let resolved = modules.resolve(specifier, "", true).await?;
        let source = modules.load(&resolved).await?;
        self.evaluate(&source.module_name, &source.code).await
    }

    async fn drain(&mut self) -> anyhow::Result<()> {
        while let Some(name) = self.deferred.pop_front() {
            let body = self
                .procedures
                .get(&name)
                .cloned()
                .ok_or_else(|| anyhow!("undefined procedure '{name}'"))?;
            self.run_block(body).await?;
        }
        Ok(())
    }

    fn snapshot(&mut self) -> anyhow::Result<Vec<u8>> {
        serde_json::to_vec(&self.procedures).context("snapshot encode failed")
    }
}

type Parsed = (HashMap<String, Vec<Stmt>>, Vec<Stmt>);

fn parse(source: &str) -> anyhow::Result<Parsed> {
    let mut procedures = HashMap::new();
    let mut top_level = Vec::new();
    let mut current: Option<(String, Vec<Stmt>)> = None;

    for (idx, raw_line) in source.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if let Some(name) = line.strip_prefix("def ") {
            if current.is_some() {
                bail!("line {}: nested def", idx + 1);
            }
            current = Some((name.trim().to_string(), Vec::new()));
        } else if line == "end" {
            let (name, body) = current
                .take()
                .ok_or_else(|| anyhow!("line {}: end outside def", idx + 1))?;
            procedures.insert(name, body);
        } else {
            let stmt = parse_stmt(line).with_context(|| format!("line {}", idx + 1))?;
            match &mut current {
                Some((_, body)) => body.push(stmt),
                None => top_level.push(stmt),
            }
        }
    }

    if let Some((name, _)) = current {
        bail!("unterminated def '{name}'");
    }
    Ok((procedures, top_level))
}

fn parse_stmt(line: &str) -> anyhow::Result<Stmt> {
    if let Some(rest) = line.strip_prefix("dispatchraw ") {
        let mut parts = rest.split_whitespace();
        let cap = parts.next().ok_or_else(|| anyhow!("dispatchraw needs a capability"))?;
        let payload = parts.next().ok_or_else(|| anyhow!("dispatchraw needs a payload"))?;
        let raw = parts.next().ok_or_else(|| anyhow!("dispatchraw needs a raw buffer"))?;
        Ok(Stmt::Dispatch {
            cap: cap.to_string(),
            payload: payload.to_string(),
            raw: Some(raw.to_string()),
        })
    } else if let Some(rest) = line.strip_prefix("dispatch ") {
        let (cap, payload) = rest
            .split_once(' ')
            .ok_or_else(|| anyhow!("dispatch needs a capability and a payload"))?;
        Ok(Stmt::Dispatch {
            cap: cap.to_string(),
            payload: payload.trim().to_string(),
            raw: None,
        })
    } else if let Some(rest) = line.strip_prefix("call ") {
        Ok(Stmt::Call(rest.trim().to_string()))
    } else if let Some(rest) = line.strip_prefix("spawn ") {
        Ok(Stmt::Spawn(rest.trim().to_string()))
    } else if let Some(name) = line.strip_suffix("()") {
        Ok(Stmt::Call(name.trim().to_string()))
    } else {
        bail!("unrecognized statement '{line}'")
    }
}
