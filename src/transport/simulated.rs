//! Simulated transport, a store-backed backend with no process or network.
//!
//! The tool catalog lives in the `simulated_tools` table (seeded with a
//! default catalog on first connect). Calls wait out an artificial latency,
//! fabricate a deterministic result and are appended to `simulated_calls`.

use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::sync::Notify;

use super::errors::TransportError;
use super::pending::LinkState;
use super::types::ConnectionState;
use crate::storage::database::{lock, SharedDatabase};
use crate::storage::SimulatedTool;

// ─── SimulatedClient ─────────────────────────────────────────────────────────

pub struct SimulatedClient {
    backend_id: String,
    db: SharedDatabase,
    latency: Duration,
    link: LinkState,
    tools: std::sync::Mutex<Vec<SimulatedTool>>,
    /// Wakes in-flight calls when the client disconnects.
    disconnects: Notify,
}

impl SimulatedClient {
    pub fn new(backend_id: &str, db: SharedDatabase, latency: Duration) -> Self {
        Self {
            backend_id: backend_id.to_string(),
            db,
            latency,
            link: LinkState::new(),
            tools: std::sync::Mutex::new(Vec::new()),
            disconnects: Notify::new(),
        }
    }

    pub fn backend_id(&self) -> &str {
        &self.backend_id
    }

    pub fn state(&self) -> ConnectionState {
        self.link.current()
    }

    /// Load the catalog from the store, seeding the default one if empty.
    pub async fn connect(&self) -> Result<(), TransportError> {
        if self.link.is_connected() {
            return Ok(());
        }
        let generation = self.link.begin_connect();

        let loaded = {
            let mut db = lock(&self.db);
            db.simulated_tools(&self.backend_id).and_then(|tools| {
                if tools.is_empty() {
                    let seeded = default_catalog();
                    db.replace_simulated_tools(&self.backend_id, &seeded)?;
                    tracing::info!(backend = %self.backend_id, count = seeded.len(), "seeded simulated tool catalog");
                    Ok(seeded)
                } else {
                    Ok(tools)
                }
            })
        };

        match loaded {
            Ok(tools) => {
                let count = tools.len();
                *self.tools.lock().unwrap_or_else(|e| e.into_inner()) = tools;
                self.link.set(generation, ConnectionState::Connected);
                tracing::info!(backend = %self.backend_id, tools = count, "simulated backend connected");
                Ok(())
            }
            Err(e) => {
                self.link.set(generation, ConnectionState::Error);
                Err(TransportError::Connection {
                    backend: self.backend_id.clone(),
                    reason: format!("failed to load simulated catalog: {e}"),
                })
            }
        }
    }

    /// Reject in-flight calls and go back to `Disconnected`.
    pub async fn disconnect(&self) {
        self.link.reset();
        self.disconnects.notify_waiters();
        tracing::info!(backend = %self.backend_id, "simulated backend disconnected");
    }

    fn ensure_connected(&self) -> Result<(), TransportError> {
        if self.link.is_connected() {
            Ok(())
        } else {
            Err(TransportError::NotConnected {
                backend: self.backend_id.clone(),
            })
        }
    }

    pub async fn list_tools(&self) -> Result<Vec<serde_json::Value>, TransportError> {
        self.ensure_connected()?;
        let tools = self.tools.lock().unwrap_or_else(|e| e.into_inner());
        Ok(tools.iter().map(SimulatedTool::to_raw).collect())
    }

    pub async fn call_tool(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, TransportError> {
        // Register for the wakeup before checking state so a concurrent
        // disconnect can't slip between the two.
        let disconnected = self.disconnects.notified();
        self.ensure_connected()?;

        tokio::select! {
            _ = tokio::time::sleep(self.latency) => {}
            _ = disconnected => {
                return Err(TransportError::Disconnected {
                    backend: self.backend_id.clone(),
                });
            }
        }

        let known = self
            .tools
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .any(|t| t.name == name);
        let outcome = if known {
            fabricate(name, &arguments)
        } else {
            Err(format!("unknown tool '{name}'"))
        };

        let logged = lock(&self.db).record_simulated_call(
            &self.backend_id,
            name,
            &arguments,
            outcome.as_ref().map_err(String::as_str),
        );
        if let Err(e) = logged {
            tracing::warn!(backend = %self.backend_id, tool = name, error = %e, "failed to log simulated call");
        }

        outcome.map_err(|message| TransportError::Execution {
            backend: self.backend_id.clone(),
            tool: name.to_string(),
            message,
        })
    }
}

// ─── Default Catalog ─────────────────────────────────────────────────────────

/// Catalog written for a simulated backend that has none yet.
pub fn default_catalog() -> Vec<SimulatedTool> {
    vec![
        SimulatedTool {
            name: "calculator".into(),
            description: "Evaluate an arithmetic expression with + - * / and parentheses".into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "expression": {"type": "string", "description": "Expression to evaluate, e.g. (2 + 3) * 4"}
                },
                "required": ["expression"]
            }),
        },
        SimulatedTool {
            name: "get_weather".into(),
            description: "Get the current weather for a location".into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "location": {"type": "string", "description": "City name"},
                    "units": {"type": "string", "enum": ["celsius", "fahrenheit"]}
                },
                "required": ["location"]
            }),
        },
        SimulatedTool {
            name: "web_search".into(),
            description: "Search the web and return the top results".into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "query": {"type": "string"},
                    "limit": {"type": "integer", "minimum": 1, "maximum": 10}
                },
                "required": ["query"]
            }),
        },
        SimulatedTool {
            name: "github_repo_info".into(),
            description: "Look up summary information about a GitHub repository".into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "repo": {"type": "string", "description": "owner/name"}
                },
                "required": ["repo"]
            }),
        },
    ]
}

// ─── Fabrication ─────────────────────────────────────────────────────────────

fn fabricate(name: &str, args: &serde_json::Value) -> Result<serde_json::Value, String> {
    match name {
        "calculator" => {
            let expression = required_str(args, "expression")?;
            let value = evaluate(expression)?;
            Ok(serde_json::json!({"expression": expression, "result": number(value)}))
        }
        "get_weather" => weather(args),
        "web_search" => search(args),
        "github_repo_info" => repo_info(args),
        // Custom catalog entries without a built-in behavior.
        _ => Ok(serde_json::json!({
            "tool": name,
            "arguments": args,
            "simulated": true,
        })),
    }
}

fn required_str<'a>(args: &'a serde_json::Value, field: &str) -> Result<&'a str, String> {
    args.get(field)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| format!("missing required string argument '{field}'"))
}

fn digest(input: &str) -> [u8; 32] {
    let hash = Sha256::digest(input.trim().to_lowercase().as_bytes());
    let mut bytes = [0u8; 32];
    bytes.copy_from_slice(&hash);
    bytes
}

/// Render whole numbers as JSON integers.
fn number(value: f64) -> serde_json::Value {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        serde_json::json!(value as i64)
    } else {
        serde_json::json!(value)
    }
}

const CONDITIONS: [&str; 8] = [
    "sunny",
    "partly cloudy",
    "cloudy",
    "light rain",
    "heavy rain",
    "thunderstorms",
    "snow",
    "fog",
];

fn weather(args: &serde_json::Value) -> Result<serde_json::Value, String> {
    let location = required_str(args, "location")?;
    let fahrenheit = args.get("units").and_then(|u| u.as_str()) == Some("fahrenheit");
    let h = digest(location);

    let celsius = -10 + i64::from(h[0] % 46);
    let temperature = if fahrenheit { celsius * 9 / 5 + 32 } else { celsius };

    Ok(serde_json::json!({
        "location": location,
        "temperature": temperature,
        "units": if fahrenheit { "fahrenheit" } else { "celsius" },
        "conditions": CONDITIONS[usize::from(h[1]) % CONDITIONS.len()],
        "humidity": 20 + h[2] % 75,
        "wind_kph": h[3] % 60,
    }))
}

fn search(args: &serde_json::Value) -> Result<serde_json::Value, String> {
    let query = required_str(args, "query")?;
    let limit = args
        .get("limit")
        .and_then(|l| l.as_u64())
        .unwrap_or(3)
        .clamp(1, 10) as usize;
    let slug: String = query
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    let h = digest(query);

    let results: Vec<serde_json::Value> = (0..limit)
        .map(|i| {
            serde_json::json!({
                "title": format!("{query}: result {}", i + 1),
                "url": format!("https://example.com/{slug}/{:02x}{}", h[i], i + 1),
                "snippet": format!("Simulated result {} of {limit} for \"{query}\".", i + 1),
            })
        })
        .collect();

    Ok(serde_json::json!({"query": query, "results": results}))
}

const LANGUAGES: [&str; 6] = ["Rust", "TypeScript", "Python", "Go", "C++", "Java"];

fn repo_info(args: &serde_json::Value) -> Result<serde_json::Value, String> {
    let repo = required_str(args, "repo")?;
    let (owner, name) = repo
        .split_once('/')
        .filter(|(o, n)| !o.is_empty() && !n.is_empty() && !n.contains('/'))
        .ok_or_else(|| format!("repository must be 'owner/name', got '{repo}'"))?;
    let h = digest(repo);

    Ok(serde_json::json!({
        "full_name": format!("{owner}/{name}"),
        "description": format!("Simulated repository {name} maintained by {owner}"),
        "language": LANGUAGES[usize::from(h[0]) % LANGUAGES.len()],
        "stars": u32::from_be_bytes([0, h[1], h[2], h[3]]) % 50_000,
        "forks": u16::from_be_bytes([h[4], h[5]]) % 5_000,
        "open_issues": h[6] % 200,
    }))
}

// ─── Arithmetic ──────────────────────────────────────────────────────────────

/// Evaluate `+ - * / ( )` with unary sign and decimal literals.
pub fn evaluate(expression: &str) -> Result<f64, String> {
    if expression.len() > MAX_EXPRESSION_LEN {
        return Err(format!(
            "expression longer than {MAX_EXPRESSION_LEN} characters"
        ));
    }
    let mut parser = ExprParser {
        chars: expression.chars().filter(|c| !c.is_whitespace()).collect(),
        pos: 0,
        depth: 0,
    };
    let value = parser.expr()?;
    if parser.pos < parser.chars.len() {
        return Err(format!(
            "unexpected '{}' at position {}",
            parser.chars[parser.pos], parser.pos
        ));
    }
    if !value.is_finite() {
        return Err("result is not a finite number".into());
    }
    Ok(value)
}

/// Longest calculator input accepted.
const MAX_EXPRESSION_LEN: usize = 4096;

/// Parentheses plus unary signs allowed on one path.
const MAX_NESTING: usize = 64;

struct ExprParser {
    chars: Vec<char>,
    pos: usize,
    depth: usize,
}

impl ExprParser {
    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn factor(&mut self) -> Result<f64, String> {
        self.depth += 1;
        if self.depth > MAX_NESTING {
            return Err("expression too deeply nested".into());
        }
        let value = self.primary();
        self.depth -= 1;
        value
    }

    fn expr(&mut self) -> Result<f64, String> {
        let mut value = self.term()?;
        while let Some(op @ ('+' | '-')) = self.peek() {
            self.pos += 1;
            let rhs = self.term()?;
            value = if op == '+' { value + rhs } else { value - rhs };
        }
        Ok(value)
    }

    fn term(&mut self) -> Result<f64, String> {
        let mut value = self.factor()?;
        while let Some(op @ ('*' | '/')) = self.peek() {
            self.pos += 1;
            let rhs = self.factor()?;
            if op == '*' {
                value *= rhs;
            } else {
                if rhs == 0.0 {
                    return Err("division by zero".into());
                }
                value /= rhs;
            }
        }
        Ok(value)
    }

    fn primary(&mut self) -> Result<f64, String> {
        match self.peek() {
            Some('-') => {
                self.pos += 1;
                Ok(-self.factor()?)
            }
            Some('+') => {
                self.pos += 1;
                self.factor()
            }
            Some('(') => {
                self.pos += 1;
                let value = self.expr()?;
                if self.peek() != Some(')') {
                    return Err("missing closing parenthesis".into());
                }
                self.pos += 1;
                Ok(value)
            }
            Some(c) if c.is_ascii_digit() || c == '.' => {
                let start = self.pos;
                while matches!(self.peek(), Some(c) if c.is_ascii_digit() || c == '.') {
                    self.pos += 1;
                }
                let literal: String = self.chars[start..self.pos].iter().collect();
                literal
                    .parse::<f64>()
                    .map_err(|_| format!("invalid number '{literal}'"))
            }
            Some(c) => Err(format!("unexpected '{c}' at position {}", self.pos)),
            None => Err("unexpected end of expression".into()),
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::storage::BridgeDatabase;

    fn client(latency: Duration) -> SimulatedClient {
        let db = BridgeDatabase::open_shared(":memory:").unwrap();
        SimulatedClient::new("sim", db, latency)
    }

    #[test]
    fn test_evaluate() {
        assert_eq!(evaluate("2+2").unwrap(), 4.0);
        assert_eq!(evaluate("2 + 3 * 4").unwrap(), 14.0);
        assert_eq!(evaluate("-(3 + 4) * 2.5").unwrap(), -17.5);
        assert_eq!(evaluate("10 / 4").unwrap(), 2.5);
        assert!(evaluate("1 / 0").unwrap_err().contains("division by zero"));
        assert!(evaluate("2 +").is_err());
        assert!(evaluate("(1 + 2").is_err());
        assert!(evaluate("2 x 3").is_err());
        assert!(evaluate("1.2.3").is_err());
    }

    #[test]
    fn test_evaluate_rejects_deep_nesting() {
        let nested = format!("{}1{}", "(".repeat(2_000), ")".repeat(2_000));
        assert_eq!(evaluate(&nested).unwrap_err(), "expression too deeply nested");

        let signs = format!("{}1", "-".repeat(1_000));
        assert_eq!(evaluate(&signs).unwrap_err(), "expression too deeply nested");

        let shallow = format!("{}1{}", "(".repeat(10), ")".repeat(10));
        assert_eq!(evaluate(&shallow).unwrap(), 1.0);
        assert_eq!(evaluate("--2").unwrap(), 2.0);
    }

    #[test]
    fn test_evaluate_rejects_oversized_input() {
        let huge = format!("{}1{}", "(".repeat(200_000), ")".repeat(200_000));
        assert!(evaluate(&huge).unwrap_err().contains("longer than"));

        let long_sum = vec!["1"; 3_000].join("+");
        assert!(evaluate(&long_sum).is_err());
    }

    #[test]
    fn test_weather_is_deterministic() {
        let a = weather(&serde_json::json!({"location": "Lisbon"})).unwrap();
        let b = weather(&serde_json::json!({"location": " lisbon "})).unwrap();
        assert_eq!(a["temperature"], b["temperature"]);
        assert_eq!(a["conditions"], b["conditions"]);
        assert!(weather(&serde_json::json!({})).is_err());
    }

    #[test]
    fn test_search_respects_limit() {
        let out = search(&serde_json::json!({"query": "rust async", "limit": 5})).unwrap();
        assert_eq!(out["results"].as_array().unwrap().len(), 5);
        let again = search(&serde_json::json!({"query": "rust async", "limit": 5})).unwrap();
        assert_eq!(out, again);
    }

    #[test]
    fn test_repo_info_validates_name() {
        assert!(repo_info(&serde_json::json!({"repo": "tokio-rs/tokio"})).is_ok());
        assert!(repo_info(&serde_json::json!({"repo": "tokio"})).is_err());
    }

    #[tokio::test]
    async fn test_not_connected_before_connect() {
        let c = client(Duration::ZERO);
        assert!(matches!(
            c.list_tools().await,
            Err(TransportError::NotConnected { .. })
        ));
        assert!(matches!(
            c.call_tool("calculator", serde_json::json!({})).await,
            Err(TransportError::NotConnected { .. })
        ));
    }

    #[tokio::test]
    async fn test_connect_seeds_catalog() {
        let c = client(Duration::ZERO);
        c.connect().await.unwrap();
        c.connect().await.unwrap();
        assert_eq!(c.state(), ConnectionState::Connected);

        let tools = c.list_tools().await.unwrap();
        let names: Vec<&str> = tools.iter().filter_map(|t| t["name"].as_str()).collect();
        assert_eq!(
            names,
            vec!["calculator", "get_weather", "web_search", "github_repo_info"]
        );
    }

    #[tokio::test]
    async fn test_calls_are_fabricated_and_logged() {
        let c = client(Duration::from_millis(20));
        c.connect().await.unwrap();

        let started = std::time::Instant::now();
        let out = c
            .call_tool("calculator", serde_json::json!({"expression": "2+2"}))
            .await
            .unwrap();
        assert!(started.elapsed() >= Duration::from_millis(20));
        assert_eq!(out["result"], 4);

        let err = c
            .call_tool("teleport", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Execution { .. }));

        let calls = lock(&c.db).simulated_calls("sim").unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].result.as_ref().unwrap()["result"], 4);
        assert!(calls[1].error.as_ref().unwrap().contains("unknown tool"));
    }

    #[tokio::test]
    async fn test_disconnect_rejects_in_flight_calls() {
        let c = Arc::new(client(Duration::from_secs(30)));
        c.connect().await.unwrap();

        let caller = Arc::clone(&c);
        let call = tokio::spawn(async move {
            caller
                .call_tool("web_search", serde_json::json!({"query": "x"}))
                .await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        c.disconnect().await;

        let result = tokio::time::timeout(Duration::from_secs(1), call)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(TransportError::Disconnected { .. })));
        assert_eq!(c.state(), ConnectionState::Disconnected);
    }
}
