//! Restricted pipeline language used by the LangChain-style synthesizers.
//!
//! A transform is parsed, never evaluated: the text is tokenized, parsed into
//! a call chain on `df`, and lowered to executor [`PlanStep`]s. Only the
//! declared allowed operations, column references and literals are accepted.
//!
//! ```text
//! df.filter(region == "north" & value >= 100).group_by(region).agg(total = sum(value)).sort(total, desc=true).head(5)
//! ```

use crate::error::{EngineError, Result};
use crate::executor::PlanStep;
use crate::query_spec::{Aggregation, Filter, FilterOp, Reducer, SortKey, SortOrder};
use crate::schema::DatasetSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;

const DEFAULT_HEAD_ROWS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllowedOperation {
    Filter,
    Select,
    GroupBy,
    Agg,
    Sort,
    Head,
    Count,
    Sum,
    Mean,
    Min,
    Max,
}

impl AllowedOperation {
    pub const ALL: [AllowedOperation; 11] = [
        AllowedOperation::Filter,
        AllowedOperation::Select,
        AllowedOperation::GroupBy,
        AllowedOperation::Agg,
        AllowedOperation::Sort,
        AllowedOperation::Head,
        AllowedOperation::Count,
        AllowedOperation::Sum,
        AllowedOperation::Mean,
        AllowedOperation::Min,
        AllowedOperation::Max,
    ];

    pub fn default_set() -> BTreeSet<AllowedOperation> {
        Self::ALL.iter().copied().collect()
    }

    pub fn method_name(&self) -> &'static str {
        match self {
            AllowedOperation::Filter => "filter",
            AllowedOperation::Select => "select",
            AllowedOperation::GroupBy => "group_by",
            AllowedOperation::Agg => "agg",
            AllowedOperation::Sort => "sort",
            AllowedOperation::Head => "head",
            AllowedOperation::Count => "count",
            AllowedOperation::Sum => "sum",
            AllowedOperation::Mean => "mean",
            AllowedOperation::Min => "min",
            AllowedOperation::Max => "max",
        }
    }

    fn from_method(name: &str) -> Option<Self> {
        match name {
            "filter" | "where" => Some(AllowedOperation::Filter),
            "select" => Some(AllowedOperation::Select),
            "group_by" | "groupby" => Some(AllowedOperation::GroupBy),
            "agg" => Some(AllowedOperation::Agg),
            "sort" | "sort_values" => Some(AllowedOperation::Sort),
            "head" | "limit" => Some(AllowedOperation::Head),
            "count" => Some(AllowedOperation::Count),
            "sum" => Some(AllowedOperation::Sum),
            "mean" | "avg" => Some(AllowedOperation::Mean),
            "min" => Some(AllowedOperation::Min),
            "max" => Some(AllowedOperation::Max),
            _ => None,
        }
    }

    fn reducer(&self) -> Option<Reducer> {
        match self {
            AllowedOperation::Count => Some(Reducer::Count),
            AllowedOperation::Sum => Some(Reducer::Sum),
            AllowedOperation::Mean => Some(Reducer::Mean),
            AllowedOperation::Min => Some(Reducer::Min),
            AllowedOperation::Max => Some(Reducer::Max),
            _ => None,
        }
    }
}

impl fmt::Display for AllowedOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.method_name())
    }
}

/// A parsed pipeline plus the operations it is allowed to use.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutableTransform {
    pub code: String,
    pub allowed: BTreeSet<AllowedOperation>,
    #[serde(skip)]
    calls: Vec<Call>,
}

impl ExecutableTransform {
    /// Parse `code` eagerly. Syntax errors and disallowed methods fail here.
    pub fn parse(code: &str, allowed: BTreeSet<AllowedOperation>) -> Result<Self> {
        let code = code.trim().trim_end_matches(';').trim();
        let tokens = tokenize(code)?;
        let calls = Parser::new(tokens).parse_pipeline()?;
        for call in &calls {
            match AllowedOperation::from_method(&call.name) {
                Some(op) if allowed.contains(&op) => {}
                Some(op) => return Err(exec_err(format!("Operation '{}' is not allowed here", op))),
                None => return Err(exec_err(format!("Unknown method '{}'", call.name))),
            }
        }
        Ok(Self {
            code: code.to_string(),
            allowed,
            calls,
        })
    }

    pub fn with_default_operations(code: &str) -> Result<Self> {
        Self::parse(code, AllowedOperation::default_set())
    }

    /// Lower the call chain to executor steps, checking every column reference.
    pub fn lower(&self, schema: &DatasetSchema) -> Result<Vec<PlanStep>> {
        let mut scope = Scope { schema, outputs: None };
        let mut steps = Vec::with_capacity(self.calls.len());
        let mut pending_group: Option<Vec<String>> = None;

        for call in &self.calls {
            let op = AllowedOperation::from_method(&call.name)
                .ok_or_else(|| exec_err(format!("Unknown method '{}'", call.name)))?;
            if !self.allowed.contains(&op) {
                return Err(exec_err(format!("Operation '{}' is not allowed here", op)));
            }
            if pending_group.is_some() && op != AllowedOperation::Agg && op.reducer().is_none() {
                return Err(exec_err("group_by must be followed by agg() or a reducer".to_string()));
            }

            match op {
                AllowedOperation::Filter => {
                    if scope.outputs.is_some() {
                        return Err(exec_err("filter after aggregation or select is not supported".to_string()));
                    }
                    let condition = call.single_positional()?;
                    let mut filters = Vec::new();
                    scope.lower_condition(condition, &mut filters)?;
                    steps.push(PlanStep::Filter(filters));
                }
                AllowedOperation::Select => {
                    let columns = scope.columns(&call.positional_flattened())?;
                    scope.outputs = Some(columns.clone());
                    steps.push(PlanStep::Select(columns));
                }
                AllowedOperation::GroupBy => {
                    let keys = scope.columns(&call.positional_flattened())?;
                    if keys.is_empty() {
                        return Err(exec_err("group_by needs at least one column".to_string()));
                    }
                    pending_group = Some(keys);
                }
                AllowedOperation::Agg => {
                    let mut aggregations = Vec::new();
                    for arg in &call.args {
                        let (alias, node) = match arg {
                            Arg::Named(alias, node) => (Some(alias.clone()), node),
                            Arg::Positional(node) => (None, node),
                        };
                        aggregations.push(scope.aggregation(node, alias)?);
                    }
                    if aggregations.is_empty() {
                        return Err(exec_err("agg() needs at least one aggregation".to_string()));
                    }
                    steps.push(scope.finish_aggregation(pending_group.take(), aggregations));
                }
                AllowedOperation::Sort => {
                    let columns = scope.columns(&call.positional_flattened())?;
                    if columns.is_empty() {
                        return Err(exec_err("sort needs at least one column".to_string()));
                    }
                    let order = call.sort_order()?;
                    steps.push(PlanStep::Sort(
                        columns
                            .into_iter()
                            .map(|by| SortKey { by, order })
                            .collect(),
                    ));
                }
                AllowedOperation::Head => {
                    let n = match call.positional().first() {
                        None => DEFAULT_HEAD_ROWS,
                        Some(Node::Literal(Value::Number(n))) => n
                            .as_u64()
                            .filter(|n| *n > 0)
                            .ok_or_else(|| exec_err("head() needs a positive integer".to_string()))?
                            as usize,
                        Some(_) => return Err(exec_err("head() needs a positive integer".to_string())),
                    };
                    steps.push(PlanStep::Limit(n));
                }
                AllowedOperation::Count
                | AllowedOperation::Sum
                | AllowedOperation::Mean
                | AllowedOperation::Min
                | AllowedOperation::Max => {
                    let func = op
                        .reducer()
                        .ok_or_else(|| exec_err(format!("'{}' is not a reducer", op)))?;
                    let column = match call.positional().first() {
                        Some(node) => scope.column(node)?,
                        None if func == Reducer::Count => "*".to_string(),
                        None => return Err(exec_err(format!("{}() needs a column", op))),
                    };
                    let aggregation = Aggregation {
                        column,
                        func,
                        alias: None,
                    };
                    steps.push(scope.finish_aggregation(pending_group.take(), vec![aggregation]));
                }
            }
        }

        if pending_group.is_some() {
            return Err(exec_err("group_by must be followed by agg() or a reducer".to_string()));
        }
        Ok(steps)
    }
}

fn exec_err(message: String) -> EngineError {
    EngineError::Execution(format!("Invalid transform: {}", message))
}

struct Scope<'a> {
    schema: &'a DatasetSchema,
    /// Columns produced by the last select/aggregation, if any
    outputs: Option<Vec<String>>,
}

impl<'a> Scope<'a> {
    fn column(&self, node: &Node) -> Result<String> {
        let name = match node {
            Node::Ident(name) | Node::Str(name) => name.as_str(),
            Node::Call { name, args } if name == "col" => match args.as_slice() {
                [Arg::Positional(Node::Str(inner))] | [Arg::Positional(Node::Ident(inner))] => inner.as_str(),
                _ => return Err(exec_err("col() takes one column name".to_string())),
            },
            other => return Err(exec_err(format!("Expected a column, found {}", other.describe()))),
        };

        match &self.outputs {
            Some(outputs) => outputs
                .iter()
                .find(|o| o.as_str() == name)
                .cloned()
                .ok_or_else(|| exec_err(format!("Unknown column '{}' after aggregation", name))),
            None => self
                .schema
                .resolve(name)
                .map(str::to_string)
                .ok_or_else(|| exec_err(format!("Unknown column '{}'", name))),
        }
    }

    fn columns(&self, nodes: &[&Node]) -> Result<Vec<String>> {
        nodes.iter().map(|n| self.column(n)).collect()
    }

    fn aggregation(&self, node: &Node, alias: Option<String>) -> Result<Aggregation> {
        let (name, args) = match node {
            Node::Call { name, args } => (name, args),
            other => return Err(exec_err(format!("Expected reducer(column), found {}", other.describe()))),
        };
        let func = Reducer::from_name(name).ok_or_else(|| exec_err(format!("Unknown reducer '{}'", name)))?;
        let column = match args.as_slice() {
            [] if func == Reducer::Count => "*".to_string(),
            [Arg::Positional(Node::Str(star))] if star == "*" && func == Reducer::Count => "*".to_string(),
            [Arg::Positional(node)] => self.column(node)?,
            _ => return Err(exec_err(format!("{}() takes one column", func))),
        };
        Ok(Aggregation { column, func, alias })
    }

    fn finish_aggregation(&mut self, keys: Option<Vec<String>>, aggregations: Vec<Aggregation>) -> PlanStep {
        let names: Vec<String> = aggregations.iter().map(|a| a.output_name()).collect();
        match keys {
            Some(keys) => {
                self.outputs = Some(keys.iter().cloned().chain(names).collect());
                PlanStep::GroupAggregate { keys, aggregations }
            }
            None => {
                self.outputs = Some(names);
                PlanStep::Aggregate(aggregations)
            }
        }
    }

    fn lower_condition(&self, node: &Node, out: &mut Vec<Filter>) -> Result<()> {
        match node {
            Node::And(parts) => {
                for part in parts {
                    self.lower_condition(part, out)?;
                }
            }
            Node::Compare { lhs, op, rhs } => out.push(Filter {
                column: self.column(lhs)?,
                op: *op,
                value: literal(rhs)?,
            }),
            Node::In { lhs, items } => {
                let values = match items.as_ref() {
                    Node::List(items) if !items.is_empty() => {
                        items.iter().map(literal).collect::<Result<Vec<_>>>()?
                    }
                    _ => return Err(exec_err("'in' needs a non-empty list".to_string())),
                };
                out.push(Filter {
                    column: self.column(lhs)?,
                    op: FilterOp::In,
                    value: Value::Array(values),
                });
            }
            Node::Call { name, args } if name == "contains" => match args.as_slice() {
                [Arg::Positional(column), Arg::Positional(Node::Str(needle))] => out.push(Filter {
                    column: self.column(column)?,
                    op: FilterOp::Contains,
                    value: Value::String(needle.clone()),
                }),
                _ => return Err(exec_err("contains(column, \"text\") expected".to_string())),
            },
            other => return Err(exec_err(format!("Expected a condition, found {}", other.describe()))),
        }
        Ok(())
    }
}

fn literal(node: &Node) -> Result<Value> {
    match node {
        Node::Str(s) => Ok(Value::String(s.clone())),
        Node::Literal(v) => Ok(v.clone()),
        other => Err(exec_err(format!("Expected a literal, found {}", other.describe()))),
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(serde_json::Number),
    Dot,
    Comma,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Assign,
    Amp,
    Cmp(FilterOp),
}

fn tokenize(code: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = code.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '[' => {
                tokens.push(Token::LBracket);
                i += 1;
            }
            ']' => {
                tokens.push(Token::RBracket);
                i += 1;
            }
            '&' => {
                tokens.push(Token::Amp);
                i += if chars.get(i + 1) == Some(&'&') { 2 } else { 1 };
            }
            '=' | '!' | '<' | '>' => {
                let next_is_eq = chars.get(i + 1) == Some(&'=');
                let token = match (c, next_is_eq) {
                    ('=', true) => Token::Cmp(FilterOp::Eq),
                    ('=', false) => Token::Assign,
                    ('!', true) => Token::Cmp(FilterOp::Neq),
                    ('<', true) => Token::Cmp(FilterOp::Lte),
                    ('<', false) => Token::Cmp(FilterOp::Lt),
                    ('>', true) => Token::Cmp(FilterOp::Gte),
                    ('>', false) => Token::Cmp(FilterOp::Gt),
                    _ => return Err(exec_err(format!("Unexpected '{}' at {}", c, i))),
                };
                i += if next_is_eq { 2 } else { 1 };
                tokens.push(token);
            }
            '"' | '\'' => {
                let quote = c;
                let mut text = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(exec_err("Unterminated string literal".to_string())),
                        Some('\\') => {
                            if let Some(escaped) = chars.get(i + 1) {
                                text.push(*escaped);
                            }
                            i += 2;
                        }
                        Some(ch) if *ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(ch) => {
                            text.push(*ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(text));
            }
            c if c.is_ascii_digit() || (c == '-' && chars.get(i + 1).map_or(false, |n| n.is_ascii_digit())) => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.' || chars[i] == '_') {
                    i += 1;
                }
                let raw: String = chars[start..i].iter().filter(|c| **c != '_').collect();
                let number = if raw.contains('.') {
                    raw.parse::<f64>().ok().and_then(serde_json::Number::from_f64)
                } else {
                    raw.parse::<i64>().ok().map(serde_json::Number::from)
                };
                tokens.push(Token::Num(
                    number.ok_or_else(|| exec_err(format!("Invalid number '{}'", raw)))?,
                ));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => return Err(exec_err(format!("Unexpected character '{}' at {}", other, i))),
        }
    }
    Ok(tokens)
}

#[derive(Debug, Clone, PartialEq)]
enum Arg {
    Positional(Node),
    Named(String, Node),
}

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Ident(String),
    Str(String),
    Literal(Value),
    List(Vec<Node>),
    Call { name: String, args: Vec<Arg> },
    Compare { lhs: Box<Node>, op: FilterOp, rhs: Box<Node> },
    In { lhs: Box<Node>, items: Box<Node> },
    And(Vec<Node>),
}

impl Node {
    fn describe(&self) -> String {
        match self {
            Node::Ident(name) => format!("identifier '{}'", name),
            Node::Str(s) => format!("string \"{}\"", s),
            Node::Literal(v) => format!("literal {}", v),
            Node::List(_) => "a list".to_string(),
            Node::Call { name, .. } => format!("call to '{}'", name),
            Node::Compare { .. } | Node::In { .. } | Node::And(_) => "a condition".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
struct Call {
    name: String,
    args: Vec<Arg>,
}

impl Call {
    fn positional(&self) -> Vec<&Node> {
        self.args
            .iter()
            .filter_map(|a| match a {
                Arg::Positional(node) => Some(node),
                Arg::Named(..) => None,
            })
            .collect()
    }

    /// Positional args with a single list argument expanded, so both
    /// `select(a, b)` and `select(["a", "b"])` work.
    fn positional_flattened(&self) -> Vec<&Node> {
        let positional = self.positional();
        match positional.as_slice() {
            [Node::List(items)] => items.iter().collect(),
            _ => positional,
        }
    }

    fn single_positional(&self) -> Result<&Node> {
        match self.args.as_slice() {
            [Arg::Positional(node)] => Ok(node),
            _ => Err(exec_err(format!("{}() takes exactly one argument", self.name))),
        }
    }

    fn sort_order(&self) -> Result<SortOrder> {
        let mut order = SortOrder::Asc;
        for arg in &self.args {
            if let Arg::Named(name, node) = arg {
                let flag = match node {
                    Node::Literal(Value::Bool(b)) => *b,
                    _ => return Err(exec_err(format!("{} must be true or false", name))),
                };
                order = match (name.as_str(), flag) {
                    ("desc" | "descending", true) | ("ascending" | "asc", false) => SortOrder::Desc,
                    ("desc" | "descending", false) | ("ascending" | "asc", true) => SortOrder::Asc,
                    _ => return Err(exec_err(format!("Unknown sort option '{}'", name))),
                };
            }
        }
        Ok(order)
    }
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self { tokens, pos: 0 }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_at(&self, offset: usize) -> Option<&Token> {
        self.tokens.get(self.pos + offset)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn expect(&mut self, expected: Token) -> Result<()> {
        match self.next() {
            Some(token) if token == expected => Ok(()),
            Some(token) => Err(exec_err(format!("Expected {:?}, found {:?}", expected, token))),
            None => Err(exec_err(format!("Expected {:?}, found end of input", expected))),
        }
    }

    fn parse_pipeline(&mut self) -> Result<Vec<Call>> {
        let wrapped = self.peek() == Some(&Token::LParen);
        if wrapped {
            self.next();
        }
        match self.next() {
            Some(Token::Ident(name)) if name == "df" => {}
            other => return Err(exec_err(format!("Pipeline must start with 'df', found {:?}", other))),
        }

        let mut calls = Vec::new();
        while self.peek() == Some(&Token::Dot) {
            self.next();
            let name = match self.next() {
                Some(Token::Ident(name)) => name,
                other => return Err(exec_err(format!("Expected a method name, found {:?}", other))),
            };
            self.expect(Token::LParen)?;
            let args = self.parse_args()?;
            calls.push(Call { name, args });
        }

        if wrapped {
            self.expect(Token::RParen)?;
        }
        if let Some(token) = self.peek() {
            return Err(exec_err(format!("Unexpected {:?} after pipeline", token)));
        }
        if calls.is_empty() {
            return Err(exec_err("Pipeline has no operations".to_string()));
        }
        Ok(calls)
    }

    /// Arguments up to and including the closing parenthesis.
    fn parse_args(&mut self) -> Result<Vec<Arg>> {
        let mut args = Vec::new();
        if self.peek() == Some(&Token::RParen) {
            self.next();
            return Ok(args);
        }
        loop {
            let named = matches!(
                (self.peek(), self.peek_at(1)),
                (Some(Token::Ident(_)), Some(Token::Assign))
            );
            if named {
                let name = match self.next() {
                    Some(Token::Ident(name)) => name,
                    _ => return Err(exec_err("Expected an argument name".to_string())),
                };
                self.next();
                args.push(Arg::Named(name, self.parse_expr()?));
            } else {
                args.push(Arg::Positional(self.parse_expr()?));
            }

            match self.next() {
                Some(Token::Comma) => continue,
                Some(Token::RParen) => break,
                other => return Err(exec_err(format!("Expected ',' or ')', found {:?}", other))),
            }
        }
        Ok(args)
    }

    fn parse_expr(&mut self) -> Result<Node> {
        let first = self.parse_comparison()?;
        let mut parts = vec![first];
        loop {
            match self.peek() {
                Some(Token::Amp) => {}
                Some(Token::Ident(word)) if word == "and" => {}
                _ => break,
            }
            self.next();
            parts.push(self.parse_comparison()?);
        }
        if parts.len() == 1 {
            Ok(parts.remove(0))
        } else {
            Ok(Node::And(parts))
        }
    }

    fn parse_comparison(&mut self) -> Result<Node> {
        let lhs = self.parse_primary()?;
        match self.peek().cloned() {
            Some(Token::Cmp(op)) => {
                self.next();
                let rhs = self.parse_primary()?;
                Ok(Node::Compare {
                    lhs: Box::new(lhs),
                    op,
                    rhs: Box::new(rhs),
                })
            }
            Some(Token::Ident(word)) if word == "in" => {
                self.next();
                let items = self.parse_primary()?;
                Ok(Node::In {
                    lhs: Box::new(lhs),
                    items: Box::new(items),
                })
            }
            _ => Ok(lhs),
        }
    }

    fn parse_primary(&mut self) -> Result<Node> {
        match self.next() {
            Some(Token::Str(s)) => Ok(Node::Str(s)),
            Some(Token::Num(n)) => Ok(Node::Literal(Value::Number(n))),
            Some(Token::Ident(word)) => match word.as_str() {
                "true" | "True" => Ok(Node::Literal(Value::Bool(true))),
                "false" | "False" => Ok(Node::Literal(Value::Bool(false))),
                "null" | "None" => Ok(Node::Literal(Value::Null)),
                "df" if self.peek() == Some(&Token::LBracket) => {
                    self.next();
                    let column = match self.next() {
                        Some(Token::Str(s)) => s,
                        other => return Err(exec_err(format!("Expected a quoted column, found {:?}", other))),
                    };
                    self.expect(Token::RBracket)?;
                    Ok(Node::Str(column))
                }
                _ if self.peek() == Some(&Token::LParen) => {
                    self.next();
                    let args = self.parse_args()?;
                    Ok(Node::Call { name: word, args })
                }
                _ => Ok(Node::Ident(word)),
            },
            Some(Token::LBracket) => {
                let mut items = Vec::new();
                if self.peek() == Some(&Token::RBracket) {
                    self.next();
                    return Ok(Node::List(items));
                }
                loop {
                    items.push(self.parse_primary()?);
                    match self.next() {
                        Some(Token::Comma) => continue,
                        Some(Token::RBracket) => break,
                        other => return Err(exec_err(format!("Expected ',' or ']', found {:?}", other))),
                    }
                }
                Ok(Node::List(items))
            }
            Some(Token::LParen) => {
                let inner = self.parse_expr()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            other => Err(exec_err(format!("Unexpected {:?}", other))),
        }
    }
}
