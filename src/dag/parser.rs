//! DAG configuration parser.
//!
//! The configuration DSL embeds `$var(dotted.path)` placeholders (resolved
//! from the `params` section) and, inside `foreach` scopes, `$iter(item)` /
//! `$iter(index)`. Expansion never evaluates user strings; it runs fixed
//! passes in order:
//!
//! 1. deep `$var` substitution across the whole configuration;
//! 2. node-level `foreach {items, do}` expansion into `<name>@<index>`
//!    nodes;
//! 3. value-level `foreach` expansion inside node subtrees into lists;
//! 4. fusion of `<name>@<index>` keys with equal-length list values into a
//!    single key of per-index tuples.
//!
//! A string that *is* a single placeholder resolves with the referenced
//! value's original type; placeholders embedded in longer strings
//! substitute their string form.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};

use super::model::DagModel;
use crate::error::{PipelimeError, Result};

pub const VAR_COMMAND: &str = "var";
pub const ITER_COMMAND: &str = "iter";
pub const FOREACH_KEY: &str = "foreach";
pub const FOREACH_ITEMS_KEY: &str = "items";
pub const FOREACH_DO_KEY: &str = "do";
pub const ARG_SPLIT_CHAR: char = '@';

static PLACEHOLDER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$(\w+)\(([^)]+)\)").expect("placeholder regex is valid"));

/// Parsed DAG configuration file: `parser_name` selects the parser variant,
/// `params` feeds `$var`, `nodes` holds the node specs.
#[derive(Debug, Clone)]
pub struct DagConfig {
    pub parser_name: Option<String>,
    pub params: Value,
    pub nodes: Value,
}

impl DagConfig {
    pub fn from_value(cfg: &Value) -> Result<DagConfig> {
        let Value::Object(map) = cfg else {
            return Err(PipelimeError::config(
                "<root>",
                "the configuration must be a mapping",
            ));
        };
        let nodes = map
            .get("nodes")
            .cloned()
            .ok_or_else(|| PipelimeError::config("nodes", "missing nodes section"))?;
        Ok(DagConfig {
            parser_name: map
                .get("parser_name")
                .and_then(Value::as_str)
                .map(str::to_string),
            params: map.get("params").cloned().unwrap_or(Value::Null),
            nodes,
        })
    }

    pub fn from_yaml(text: &str) -> Result<DagConfig> {
        let cfg: Value = serde_yaml::from_str(text)?;
        DagConfig::from_value(&cfg)
    }
}

/// Parse a DAG configuration with the parser named in `parser_name`
/// (only the simple parser ships; unknown names are configuration errors).
pub fn parse_dag(config: &DagConfig) -> Result<DagModel> {
    // `$var` paths spell the section out (`params.foo`), so the lookup
    // root nests the params section under its name.
    let scope = serde_json::json!({ "params": config.params });
    match config.parser_name.as_deref() {
        None | Some("simple") => SimpleParser::new(scope).parse(&config.nodes),
        Some(other) => Err(PipelimeError::config(
            "parser_name",
            format!("unknown parser '{other}'"),
        )),
    }
}

pub struct SimpleParser {
    params: Value,
}

impl SimpleParser {
    pub fn new(params: Value) -> SimpleParser {
        SimpleParser { params }
    }

    pub fn parse(&self, nodes: &Value) -> Result<DagModel> {
        let substituted = self.replace_variables_deep(nodes)?;
        let expanded = self.expand_nodes(&substituted)?;
        let expanded = self.expand_node_arguments(&expanded)?;
        let fused = self.merge_indexed_arguments(&expanded)?;
        DagModel::from_nodes_value(&fused)
    }

    fn resolve_var(&self, path: &str) -> Result<Value> {
        crate::value::lookup_value(&self.params, path)
            .cloned()
            .ok_or_else(|| {
                PipelimeError::config(
                    format!("$var({path})"),
                    "path not found among provided params",
                )
            })
    }

    /// Substitute placeholders in one string. `resolver` handles one
    /// command kind and leaves the others untouched.
    fn parse_string<F>(&self, s: &str, resolver: &F) -> Result<Value>
    where
        F: Fn(&str, &str) -> Result<Option<Value>>,
    {
        let matches: Vec<_> = PLACEHOLDER_RE.captures_iter(s).collect();
        if matches.is_empty() {
            return Ok(Value::String(s.to_string()));
        }
        // A string that is exactly one placeholder keeps the referenced
        // value's type.
        if matches.len() == 1 {
            let whole = matches[0].get(0).unwrap();
            if whole.as_str() == s {
                let command = matches[0].get(1).unwrap().as_str();
                let content = matches[0].get(2).unwrap().as_str();
                if let Some(value) = resolver(command, content)? {
                    return Ok(value);
                }
                return Ok(Value::String(s.to_string()));
            }
        }
        let mut out = String::new();
        let mut last = 0;
        for caps in &matches {
            let whole = caps.get(0).unwrap();
            let command = caps.get(1).unwrap().as_str();
            let content = caps.get(2).unwrap().as_str();
            out.push_str(&s[last..whole.start()]);
            match resolver(command, content)? {
                Some(value) => out.push_str(&stringify(&value)),
                None => out.push_str(whole.as_str()),
            }
            last = whole.end();
        }
        out.push_str(&s[last..]);
        Ok(Value::String(out))
    }

    fn walk<F>(&self, value: &Value, resolver: &F) -> Result<Value>
    where
        F: Fn(&str, &str) -> Result<Option<Value>>,
    {
        Ok(match value {
            Value::String(s) => self.parse_string(s, resolver)?,
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|item| self.walk(item, resolver))
                    .collect::<Result<Vec<_>>>()?,
            ),
            Value::Object(map) => {
                let mut out = Map::new();
                for (key, item) in map {
                    out.insert(key.clone(), self.walk(item, resolver)?);
                }
                Value::Object(out)
            }
            other => other.clone(),
        })
    }

    fn replace_variables_deep(&self, value: &Value) -> Result<Value> {
        self.walk(value, &|command, content| {
            if command.eq_ignore_ascii_case(VAR_COMMAND) {
                self.resolve_var(content).map(Some)
            } else {
                Ok(None)
            }
        })
    }

    fn iter_resolver(
        index: usize,
        item: &Value,
    ) -> impl Fn(&str, &str) -> Result<Option<Value>> + '_ {
        move |command, content| {
            if !command.eq_ignore_ascii_case(ITER_COMMAND) {
                return Ok(None);
            }
            let scope = serde_json::json!({ "index": index, "item": item });
            crate::value::lookup_value(&scope, content)
                .cloned()
                .map(Some)
                .ok_or_else(|| {
                    PipelimeError::config(
                        format!("$iter({content})"),
                        "only 'index' and 'item' paths are valid inside foreach",
                    )
                })
        }
    }

    /// Split a foreach block into its (do, items) parts.
    fn extract_foreach<'a>(&self, node: &'a Value) -> Result<Option<(&'a Value, &'a Vec<Value>)>> {
        let Some(foreach) = node.get(FOREACH_KEY) else {
            return Ok(None);
        };
        let (Some(do_block), Some(items)) =
            (foreach.get(FOREACH_DO_KEY), foreach.get(FOREACH_ITEMS_KEY))
        else {
            return Err(PipelimeError::config(
                FOREACH_KEY,
                "invalid foreach block, missing 'do' or 'items'",
            ));
        };
        let Value::Array(items) = items else {
            return Err(PipelimeError::config(
                format!("{FOREACH_KEY}.{FOREACH_ITEMS_KEY}"),
                "foreach items must be a list",
            ));
        };
        Ok(Some((do_block, items)))
    }

    /// Expand node-level foreach blocks into one node per item, named
    /// `<original>@<index>`.
    fn expand_nodes(&self, nodes: &Value) -> Result<Value> {
        let Value::Object(map) = nodes else {
            return Err(PipelimeError::config(
                "nodes",
                "the nodes section must be a mapping",
            ));
        };
        let mut out = Map::new();
        for (name, node) in map {
            match self.extract_foreach(node)? {
                None => {
                    out.insert(name.clone(), node.clone());
                }
                Some((do_block, items)) => {
                    if !do_block.is_object() {
                        return Err(PipelimeError::config(
                            format!("nodes.{name}.{FOREACH_KEY}.{FOREACH_DO_KEY}"),
                            "a node-level foreach body must be a mapping",
                        ));
                    }
                    for (index, item) in items.iter().enumerate() {
                        let resolver = Self::iter_resolver(index, item);
                        let generated = self.walk(do_block, &resolver)?;
                        out.insert(format!("{name}{ARG_SPLIT_CHAR}{index}"), generated);
                    }
                }
            }
        }
        Ok(Value::Object(out))
    }

    /// Expand value-level foreach blocks inside node subtrees into lists.
    fn expand_node_arguments(&self, nodes: &Value) -> Result<Value> {
        let Value::Object(map) = nodes else {
            return Err(PipelimeError::config("nodes", "expected a mapping"));
        };
        let mut out = Map::new();
        for (name, node) in map {
            let Value::Object(fields) = node else {
                out.insert(name.clone(), node.clone());
                continue;
            };
            let mut new_fields = Map::new();
            for (field, value) in fields {
                let Value::Object(entries) = value else {
                    new_fields.insert(field.clone(), value.clone());
                    continue;
                };
                let mut new_entries = Map::new();
                for (entry_key, entry_value) in entries {
                    match self.extract_foreach(entry_value)? {
                        Some((do_block, items)) => {
                            let mut expanded = Vec::with_capacity(items.len());
                            for (index, item) in items.iter().enumerate() {
                                let resolver = Self::iter_resolver(index, item);
                                expanded.push(self.walk(do_block, &resolver)?);
                            }
                            new_entries.insert(entry_key.clone(), Value::Array(expanded));
                        }
                        None => {
                            new_entries.insert(entry_key.clone(), entry_value.clone());
                        }
                    }
                }
                new_fields.insert(field.clone(), Value::Object(new_entries));
            }
            out.insert(name.clone(), Value::Object(new_fields));
        }
        Ok(Value::Object(out))
    }

    /// Fuse `<name>@<index>` keys with equal-length list values into one
    /// `name` key whose value zips the indexed lists into per-index tuples.
    fn merge_indexed_arguments(&self, nodes: &Value) -> Result<Value> {
        let Value::Object(map) = nodes else {
            return Err(PipelimeError::config("nodes", "expected a mapping"));
        };
        let mut out = Map::new();
        for (name, node) in map {
            let Value::Object(fields) = node else {
                out.insert(name.clone(), node.clone());
                continue;
            };
            let mut new_fields = Map::new();
            for (field, value) in fields {
                let Value::Object(entries) = value else {
                    new_fields.insert(field.clone(), value.clone());
                    continue;
                };
                // Group indexed keys by base name, in index order.
                let mut plain = Map::new();
                let mut grouped: Vec<(String, Vec<(usize, Vec<Value>)>)> = Vec::new();
                for (entry_key, entry_value) in entries {
                    let Some((base, index)) = split_indexed_key(entry_key) else {
                        plain.insert(entry_key.clone(), entry_value.clone());
                        continue;
                    };
                    let Value::Array(items) = entry_value else {
                        return Err(PipelimeError::config(
                            format!("nodes.{name}.{field}.{entry_key}"),
                            "indexed arguments must be lists",
                        ));
                    };
                    match grouped.iter_mut().find(|(b, _)| *b == base) {
                        Some((_, rows)) => rows.push((index, items.clone())),
                        None => grouped.push((base, vec![(index, items.clone())])),
                    }
                }
                for (base, mut rows) in grouped {
                    rows.sort_by_key(|(index, _)| *index);
                    let row_len = rows[0].1.len();
                    if rows.iter().any(|(_, items)| items.len() != row_len) {
                        return Err(PipelimeError::config(
                            format!("nodes.{name}.{field}.{base}"),
                            "indexed arguments must have equal lengths",
                        ));
                    }
                    let fused: Vec<Value> = (0..row_len)
                        .map(|r| {
                            Value::Array(rows.iter().map(|(_, items)| items[r].clone()).collect())
                        })
                        .collect();
                    plain.insert(base, Value::Array(fused));
                }
                new_fields.insert(field.clone(), Value::Object(plain));
            }
            out.insert(name.clone(), Value::Object(new_fields));
        }
        Ok(Value::Object(out))
    }
}

fn split_indexed_key(key: &str) -> Option<(String, usize)> {
    let (base, index) = key.rsplit_once(ARG_SPLIT_CHAR)?;
    Some((base.to_string(), index.parse().ok()?))
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
