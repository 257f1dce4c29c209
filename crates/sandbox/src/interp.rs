//! Async tree-walking evaluator.
//!
//! Every evaluation step returns a boxed future so that scripts can suspend
//! on tool calls at any depth. Deadline checks run at every statement, loop
//! iteration and function call; every await selects on the execution's
//! cancellation token.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::Value as Json;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::ast::{
    BinaryOp, Binding, Block, DeclKind, Element, Expr, FunctionBody, Literal, LogicalOp, Pattern,
    Property, PropertyKey, Stmt, TemplatePart, UnaryOp,
};
use crate::builtins::{self, ArrayMethod, Builtin, StringMethod};
use crate::logs::LogBuffer;
use crate::runtime::ToolInvoker;
use crate::value::{
    Closure, Completion, Exception, Object, Value, array_index, format_number, lock,
};

const MAX_CALL_DEPTH: usize = 64;

pub(crate) type Flow<'a, T> = BoxFuture<'a, Completion<T>>;

/// How a statement finished.
#[derive(Debug)]
pub(crate) enum Signal {
    Normal,
    Return(Value),
    Break,
    Continue,
}

// --- Scopes ---

#[derive(Clone)]
struct Variable {
    value: Value,
    mutable: bool,
}

/// A lexical environment.
pub struct Scope {
    vars: Mutex<HashMap<String, Variable>>,
    parent: Option<Arc<Scope>>,
}

impl Scope {
    pub fn root() -> Arc<Self> {
        Arc::new(Self {
            vars: Mutex::new(HashMap::new()),
            parent: None,
        })
    }

    pub fn child(parent: &Arc<Scope>) -> Arc<Self> {
        Arc::new(Self {
            vars: Mutex::new(HashMap::new()),
            parent: Some(parent.clone()),
        })
    }

    /// A sibling holding copies of this scope's own bindings.
    fn fork(&self) -> Arc<Self> {
        Arc::new(Self {
            vars: Mutex::new(lock(&self.vars).clone()),
            parent: self.parent.clone(),
        })
    }

    /// Install a read-only global.
    pub fn define(&self, name: &str, value: Value) {
        lock(&self.vars).insert(
            name.to_string(),
            Variable {
                value,
                mutable: false,
            },
        );
    }

    pub fn declare(&self, name: &str, value: Value, kind: DeclKind) -> Completion<()> {
        let mut vars = lock(&self.vars);
        if let Some(existing) = vars.get(name) {
            if !existing.mutable || kind != DeclKind::Var {
                return Err(Exception::error(
                    "SyntaxError",
                    format!("Identifier '{name}' has already been declared"),
                ));
            }
        }
        vars.insert(
            name.to_string(),
            Variable {
                value,
                mutable: kind != DeclKind::Const,
            },
        );
        Ok(())
    }

    fn has_own(&self, name: &str) -> bool {
        lock(&self.vars).contains_key(name)
    }

    pub fn lookup(&self, name: &str) -> Completion<Value> {
        let mut scope = self;
        loop {
            if let Some(var) = lock(&scope.vars).get(name) {
                return Ok(var.value.clone());
            }
            match &scope.parent {
                Some(parent) => scope = parent.as_ref(),
                None => {
                    return Err(Exception::reference_error(format!("{name} is not defined")));
                }
            }
        }
    }

    pub fn assign(&self, name: &str, value: Value) -> Completion<()> {
        let mut scope = self;
        loop {
            if let Some(var) = lock(&scope.vars).get_mut(name) {
                if !var.mutable {
                    return Err(Exception::type_error("Assignment to constant variable."));
                }
                var.value = value;
                return Ok(());
            }
            match &scope.parent {
                Some(parent) => scope = parent.as_ref(),
                None => {
                    return Err(Exception::reference_error(format!("{name} is not defined")));
                }
            }
        }
    }
}

// --- Host state ---

#[derive(Default)]
struct CallLedger {
    issued: Vec<String>,
    outstanding: Vec<String>,
}

/// Per-execution state shared by every evaluation step.
pub(crate) struct Host {
    pub invoker: Arc<dyn ToolInvoker>,
    pub logs: Arc<LogBuffer>,
    pub cancel: CancellationToken,
    deadline: Instant,
    calls: Mutex<CallLedger>,
}

impl Host {
    pub fn new(invoker: Arc<dyn ToolInvoker>, logs: Arc<LogBuffer>, deadline: Instant) -> Self {
        Self {
            invoker,
            logs,
            cancel: CancellationToken::new(),
            deadline,
            calls: Mutex::new(CallLedger::default()),
        }
    }

    pub fn check_deadline(&self) -> Completion<()> {
        if self.cancel.is_cancelled() || Instant::now() >= self.deadline {
            return Err(Exception::Cancelled);
        }
        Ok(())
    }

    /// Ids drawn so far, in issue order.
    pub fn issued(&self) -> Vec<String> {
        lock(&self.calls).issued.clone()
    }

    /// Ids of calls that started but have not completed.
    pub fn outstanding(&self) -> Vec<String> {
        lock(&self.calls).outstanding.clone()
    }

    /// Dispatch one tool call under a fresh correlation id.
    pub async fn call_tool(&self, name: String, params: Json) -> Completion<Value> {
        self.check_deadline()?;

        let call_id = Uuid::new_v4().to_string();
        {
            let mut calls = lock(&self.calls);
            calls.issued.push(call_id.clone());
            calls.outstanding.push(call_id.clone());
        }
        tracing::debug!(tool = %name, call_id = %call_id, "dispatching tool call from script");

        let result = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return Err(Exception::Cancelled),
            result = self.invoker.call_tool(&name, params, &call_id) => result,
        };
        lock(&self.calls).outstanding.retain(|id| *id != call_id);

        match result {
            Ok(json) => Ok(Value::from_json(&json)),
            Err(err) => Err(Exception::error("Error", err.0)),
        }
    }
}

// --- Interpreter ---

/// Evaluator bound to one execution and one call depth.
#[derive(Clone)]
pub(crate) struct Interpreter {
    pub host: Arc<Host>,
    depth: usize,
}

enum Place {
    Binding(String),
    Property(Value, String),
}

impl Interpreter {
    pub fn new(host: Arc<Host>) -> Self {
        Self { host, depth: 0 }
    }

    /// Run a script body; its `return` value is the result.
    pub async fn run(&self, body: &Block, globals: &Arc<Scope>) -> Completion<Value> {
        let scope = Scope::child(globals);
        match self.exec_block(body, scope).await? {
            Signal::Return(value) => self.await_value(value).await,
            _ => Ok(Value::Undefined),
        }
    }

    /// Resolve promises, adopting nested ones.
    pub async fn await_value(&self, mut value: Value) -> Completion<Value> {
        loop {
            let Value::Promise(promise) = value else {
                return Ok(value);
            };
            self.host.check_deadline()?;
            value = tokio::select! {
                biased;
                () = self.host.cancel.cancelled() => return Err(Exception::Cancelled),
                result = promise => result?,
            };
        }
    }

    // --- Calls ---

    pub fn call<'a>(&'a self, callee: &'a Value, args: Vec<Value>) -> Flow<'a, Value> {
        async move {
            self.host.check_deadline()?;
            match callee {
                Value::Function(closure) => {
                    if self.depth >= MAX_CALL_DEPTH {
                        return Err(Exception::range_error("Maximum call stack size exceeded"));
                    }
                    let inner = Interpreter {
                        host: self.host.clone(),
                        depth: self.depth + 1,
                    };
                    let closure = closure.clone();
                    if closure.def.is_async {
                        let promise = async move { inner.invoke(&closure, args).await }.boxed();
                        return Ok(Value::promise(promise));
                    }
                    inner.invoke(&closure, args).await
                }
                Value::Native(native) => builtins::call(self, native, args).await,
                other => Err(Exception::type_error(format!(
                    "{} is not a function",
                    other.display()
                ))),
            }
        }
        .boxed()
    }

    fn invoke<'a>(&'a self, closure: &'a Closure, args: Vec<Value>) -> Flow<'a, Value> {
        async move {
            let def = &closure.def;
            let scope = Scope::child(&closure.scope);
            let mut args = args.into_iter();
            for param in &def.params {
                let value = args.next().unwrap_or(Value::Undefined);
                self.bind_binding(param, value, &scope, DeclKind::Let).await?;
            }
            if let Some(rest) = &def.rest {
                self.bind(rest, Value::array(args.collect()), &scope, DeclKind::Let)
                    .await?;
            }
            match &def.body {
                FunctionBody::Expr(expr) => self.eval(expr, &scope).await,
                FunctionBody::Block(block) => match self.exec_block(block, scope).await? {
                    Signal::Return(value) => Ok(value),
                    _ => Ok(Value::Undefined),
                },
            }
        }
        .boxed()
    }

    // --- Statements ---

    pub fn exec_block<'a>(&'a self, block: &'a [Stmt], scope: Arc<Scope>) -> Flow<'a, Signal> {
        async move {
            for stmt in block {
                if let Stmt::Function(def) = stmt {
                    if let Some(name) = &def.name {
                        let closure = Closure {
                            def: def.clone(),
                            scope: scope.clone(),
                        };
                        scope.declare(name, Value::Function(Arc::new(closure)), DeclKind::Var)?;
                    }
                }
            }
            for stmt in block {
                match self.exec(stmt, &scope).await? {
                    Signal::Normal => {}
                    signal => return Ok(signal),
                }
            }
            Ok(Signal::Normal)
        }
        .boxed()
    }

    fn exec<'a>(&'a self, stmt: &'a Stmt, scope: &'a Arc<Scope>) -> Flow<'a, Signal> {
        async move {
            self.host.check_deadline()?;
            match stmt {
                Stmt::Declare { kind, declarators } => {
                    for (pattern, init) in declarators {
                        let value = match init {
                            Some(expr) => self.eval(expr, scope).await?,
                            None => Value::Undefined,
                        };
                        self.bind(pattern, value, scope, *kind).await?;
                    }
                    Ok(Signal::Normal)
                }
                Stmt::Function(def) => {
                    if let Some(name) = &def.name {
                        if !scope.has_own(name) {
                            let closure = Closure {
                                def: def.clone(),
                                scope: scope.clone(),
                            };
                            scope.declare(
                                name,
                                Value::Function(Arc::new(closure)),
                                DeclKind::Var,
                            )?;
                        }
                    }
                    Ok(Signal::Normal)
                }
                Stmt::Expr(expr) => {
                    self.eval(expr, scope).await?;
                    Ok(Signal::Normal)
                }
                Stmt::Return(expr) => {
                    let value = match expr {
                        Some(expr) => self.eval(expr, scope).await?,
                        None => Value::Undefined,
                    };
                    Ok(Signal::Return(value))
                }
                Stmt::Throw(expr) => Err(Exception::Thrown(self.eval(expr, scope).await?)),
                Stmt::If {
                    test,
                    consequent,
                    alternate,
                } => {
                    if self.eval(test, scope).await?.truthy() {
                        self.exec(consequent, scope).await
                    } else if let Some(alternate) = alternate {
                        self.exec(alternate, scope).await
                    } else {
                        Ok(Signal::Normal)
                    }
                }
                Stmt::Block(block) => self.exec_block(block, Scope::child(scope)).await,
                Stmt::For {
                    init,
                    test,
                    update,
                    body,
                } => {
                    let mut iteration = Scope::child(scope);
                    if let Some(init) = init {
                        self.exec(init, &iteration).await?;
                    }
                    loop {
                        self.host.check_deadline()?;
                        if let Some(test) = test {
                            if !self.eval(test, &iteration).await?.truthy() {
                                break;
                            }
                        }
                        match self.exec(body, &iteration).await? {
                            Signal::Break => break,
                            Signal::Return(value) => return Ok(Signal::Return(value)),
                            Signal::Normal | Signal::Continue => {}
                        }
                        // Closures from this iteration keep their own copy of the loop bindings.
                        iteration = iteration.fork();
                        if let Some(update) = update {
                            self.eval(update, &iteration).await?;
                        }
                    }
                    Ok(Signal::Normal)
                }
                Stmt::ForOf {
                    kind,
                    pattern,
                    iterable,
                    body,
                } => {
                    let iterable = self.eval(iterable, scope).await?;
                    for item in iterate(&iterable)? {
                        self.host.check_deadline()?;
                        let iteration = Scope::child(scope);
                        self.bind(pattern, item, &iteration, *kind).await?;
                        match self.exec(body, &iteration).await? {
                            Signal::Break => break,
                            Signal::Return(value) => return Ok(Signal::Return(value)),
                            Signal::Normal | Signal::Continue => {}
                        }
                    }
                    Ok(Signal::Normal)
                }
                Stmt::While { test, body } => {
                    loop {
                        self.host.check_deadline()?;
                        if !self.eval(test, scope).await?.truthy() {
                            break;
                        }
                        match self.exec(body, scope).await? {
                            Signal::Break => break,
                            Signal::Return(value) => return Ok(Signal::Return(value)),
                            Signal::Normal | Signal::Continue => {}
                        }
                    }
                    Ok(Signal::Normal)
                }
                Stmt::Break => Ok(Signal::Break),
                Stmt::Continue => Ok(Signal::Continue),
                Stmt::Try {
                    block,
                    handler,
                    finalizer,
                } => {
                    let mut outcome = self.exec_block(block, Scope::child(scope)).await;
                    let caught = match &outcome {
                        Err(Exception::Thrown(thrown)) => Some(thrown.clone()),
                        _ => None,
                    };
                    if let (Some(thrown), Some((param, body))) = (caught, handler) {
                        let catch_scope = Scope::child(scope);
                        outcome = match param {
                            Some(param) => {
                                match self.bind(param, thrown, &catch_scope, DeclKind::Let).await {
                                    Ok(()) => self.exec_block(body, catch_scope).await,
                                    Err(err) => Err(err),
                                }
                            }
                            None => self.exec_block(body, catch_scope).await,
                        };
                    }
                    if matches!(outcome, Err(Exception::Cancelled)) {
                        return outcome;
                    }
                    if let Some(finalizer) = finalizer {
                        match self.exec_block(finalizer, Scope::child(scope)).await? {
                            Signal::Normal => {}
                            signal => return Ok(signal),
                        }
                    }
                    outcome
                }
                Stmt::Empty => Ok(Signal::Normal),
            }
        }
        .boxed()
    }

    // --- Bindings ---

    fn bind_binding<'a>(
        &'a self,
        binding: &'a Binding,
        value: Value,
        scope: &'a Arc<Scope>,
        kind: DeclKind,
    ) -> Flow<'a, ()> {
        async move {
            let value = match (&value, &binding.default) {
                (Value::Undefined, Some(default)) => self.eval(default, scope).await?,
                _ => value,
            };
            self.bind(&binding.pattern, value, scope, kind).await
        }
        .boxed()
    }

    fn bind<'a>(
        &'a self,
        pattern: &'a Pattern,
        value: Value,
        scope: &'a Arc<Scope>,
        kind: DeclKind,
    ) -> Flow<'a, ()> {
        async move {
            match pattern {
                Pattern::Ident(name) => scope.declare(name, value, kind),
                Pattern::Array { elements, rest } => {
                    let mut items = iterate(&value)?.into_iter();
                    for element in elements {
                        let item = items.next().unwrap_or(Value::Undefined);
                        if let Some(binding) = element {
                            self.bind_binding(binding, item, scope, kind).await?;
                        }
                    }
                    if let Some(rest) = rest {
                        self.bind(rest, Value::array(items.collect()), scope, kind)
                            .await?;
                    }
                    Ok(())
                }
                Pattern::Object { properties, rest } => {
                    if value.is_nullish() {
                        return Err(Exception::type_error(format!(
                            "Cannot destructure '{}' as it is {}.",
                            value.display(),
                            value.display()
                        )));
                    }
                    for (key, binding) in properties {
                        let item = get_property(&value, key)?;
                        self.bind_binding(binding, item, scope, kind).await?;
                    }
                    if let Some(rest) = rest {
                        let mut remaining = Object::default();
                        if let Value::Object(object) = &value {
                            let entries = lock(object).entries().to_vec();
                            for (key, item) in entries {
                                if !properties.iter().any(|(taken, _)| *taken == key) {
                                    remaining.set(key, item);
                                }
                            }
                        }
                        self.bind(rest, Value::object(remaining), scope, kind).await?;
                    }
                    Ok(())
                }
            }
        }
        .boxed()
    }

    // --- Expressions ---

    pub fn eval<'a>(&'a self, expr: &'a Expr, scope: &'a Arc<Scope>) -> Flow<'a, Value> {
        async move {
            match expr {
                Expr::Literal(literal) => Ok(match literal {
                    Literal::Number(n) => Value::Number(*n),
                    Literal::String(s) => Value::from(s.as_str()),
                    Literal::Bool(b) => Value::Bool(*b),
                    Literal::Null => Value::Null,
                    Literal::Undefined => Value::Undefined,
                }),
                Expr::Template(parts) => {
                    let mut out = String::new();
                    for part in parts {
                        match part {
                            TemplatePart::Text(text) => out.push_str(text),
                            TemplatePart::Expr(expr) => {
                                out.push_str(&self.eval(expr, scope).await?.display())
                            }
                        }
                    }
                    Ok(Value::from(out))
                }
                Expr::Ident(name) => scope.lookup(name),
                Expr::Array(elements) => Ok(Value::array(self.elements(elements, scope).await?)),
                Expr::Object(properties) => {
                    let mut object = Object::default();
                    for property in properties {
                        match property {
                            Property::KeyValue(key, value) => {
                                let key = self.key(key, scope).await?;
                                let value = self.eval(value, scope).await?;
                                object.set(key, value);
                            }
                            Property::Spread(expr) => {
                                let source = self.eval(expr, scope).await?;
                                for (key, value) in own_entries(&source) {
                                    object.set(key, value);
                                }
                            }
                        }
                    }
                    Ok(Value::object(object))
                }
                Expr::Function(def) => Ok(Value::Function(Arc::new(Closure {
                    def: def.clone(),
                    scope: scope.clone(),
                }))),
                Expr::Member {
                    object,
                    property,
                    optional,
                } => {
                    let object = self.eval(object, scope).await?;
                    if *optional && object.is_nullish() {
                        return Ok(Value::Undefined);
                    }
                    let key = self.key(property, scope).await?;
                    get_property(&object, &key)
                }
                Expr::Call {
                    callee,
                    args,
                    optional,
                } => {
                    let function = self.eval(callee, scope).await?;
                    if *optional && function.is_nullish() {
                        return Ok(Value::Undefined);
                    }
                    if !function.is_callable() {
                        return Err(Exception::type_error(format!(
                            "{} is not a function",
                            describe(callee)
                        )));
                    }
                    let args = self.elements(args, scope).await?;
                    self.call(&function, args).await
                }
                Expr::New { callee, args } => {
                    let constructor = self.eval(callee, scope).await?;
                    let is_constructor = matches!(
                        &constructor,
                        Value::Native(native) if matches!(native.builtin, Builtin::Error(_))
                    );
                    if !is_constructor {
                        return Err(Exception::type_error(format!(
                            "{} is not a constructor",
                            describe(callee)
                        )));
                    }
                    let args = self.elements(args, scope).await?;
                    self.call(&constructor, args).await
                }
                Expr::Unary { op, argument } => {
                    if let (UnaryOp::TypeOf, Expr::Ident(name)) = (op, argument.as_ref()) {
                        return Ok(match scope.lookup(name) {
                            Ok(value) => Value::from(value.type_of()),
                            Err(_) => Value::from("undefined"),
                        });
                    }
                    let value = self.eval(argument, scope).await?;
                    Ok(match op {
                        UnaryOp::Not => Value::Bool(!value.truthy()),
                        UnaryOp::Neg => Value::Number(-value.to_number()),
                        UnaryOp::Plus => Value::Number(value.to_number()),
                        UnaryOp::TypeOf => Value::from(value.type_of()),
                        UnaryOp::Void => Value::Undefined,
                    })
                }
                Expr::Update {
                    increment,
                    prefix,
                    target,
                } => {
                    let place = self.place(target, scope).await?;
                    let old = read_place(&place, scope)?.to_number();
                    let new = if *increment { old + 1.0 } else { old - 1.0 };
                    write_place(&place, Value::Number(new), scope)?;
                    Ok(Value::Number(if *prefix { new } else { old }))
                }
                Expr::Binary { op, left, right } => {
                    let left = self.eval(left, scope).await?;
                    let right = self.eval(right, scope).await?;
                    Ok(binary(*op, &left, &right))
                }
                Expr::Logical { op, left, right } => {
                    let left = self.eval(left, scope).await?;
                    let short_circuit = match op {
                        LogicalOp::And => !left.truthy(),
                        LogicalOp::Or => left.truthy(),
                        LogicalOp::Nullish => !left.is_nullish(),
                    };
                    if short_circuit {
                        Ok(left)
                    } else {
                        self.eval(right, scope).await
                    }
                }
                Expr::Conditional {
                    test,
                    consequent,
                    alternate,
                } => {
                    if self.eval(test, scope).await?.truthy() {
                        self.eval(consequent, scope).await
                    } else {
                        self.eval(alternate, scope).await
                    }
                }
                Expr::Assign { op, target, value } => {
                    let place = self.place(target, scope).await?;
                    let value = match op {
                        None => self.eval(value, scope).await?,
                        Some(op) => {
                            let current = read_place(&place, scope)?;
                            let rhs = self.eval(value, scope).await?;
                            binary(*op, &current, &rhs)
                        }
                    };
                    write_place(&place, value.clone(), scope)?;
                    Ok(value)
                }
                Expr::Await(expr) => {
                    let value = self.eval(expr, scope).await?;
                    self.await_value(value).await
                }
            }
        }
        .boxed()
    }

    async fn elements(&self, elements: &[Element], scope: &Arc<Scope>) -> Completion<Vec<Value>> {
        let mut out = Vec::with_capacity(elements.len());
        for element in elements {
            match element {
                Element::Item(expr) => out.push(self.eval(expr, scope).await?),
                Element::Spread(expr) => {
                    let value = self.eval(expr, scope).await?;
                    out.extend(iterate(&value)?);
                }
            }
        }
        Ok(out)
    }

    async fn key(&self, key: &PropertyKey, scope: &Arc<Scope>) -> Completion<String> {
        match key {
            PropertyKey::Static(name) => Ok(name.clone()),
            PropertyKey::Computed(expr) => Ok(property_key(&self.eval(expr, scope).await?)),
        }
    }

    async fn place(&self, target: &Expr, scope: &Arc<Scope>) -> Completion<Place> {
        match target {
            Expr::Ident(name) => Ok(Place::Binding(name.clone())),
            Expr::Member {
                object, property, ..
            } => {
                let object = self.eval(object, scope).await?;
                let key = self.key(property, scope).await?;
                Ok(Place::Property(object, key))
            }
            _ => Err(Exception::error("SyntaxError", "Invalid assignment target")),
        }
    }
}

fn read_place(place: &Place, scope: &Scope) -> Completion<Value> {
    match place {
        Place::Binding(name) => scope.lookup(name),
        Place::Property(object, key) => get_property(object, key),
    }
}

fn write_place(place: &Place, value: Value, scope: &Scope) -> Completion<()> {
    match place {
        Place::Binding(name) => scope.assign(name, value),
        Place::Property(object, key) => set_property(object, key, value),
    }
}

/// Short source rendering of a callee for error messages.
fn describe(expr: &Expr) -> String {
    match expr {
        Expr::Ident(name) => name.clone(),
        Expr::Member {
            object,
            property: PropertyKey::Static(key),
            ..
        } => format!("{}.{key}", describe(object)),
        Expr::Member { object, .. } => format!("{}[...]", describe(object)),
        Expr::Call { callee, .. } => format!("{}(...)", describe(callee)),
        _ => "expression".into(),
    }
}

pub(crate) fn property_key(value: &Value) -> String {
    match value {
        Value::String(s) => s.to_string(),
        Value::Number(n) => format_number(*n),
        other => other.display(),
    }
}

/// Elements of an iterable value (arrays and strings).
pub(crate) fn iterate(value: &Value) -> Completion<Vec<Value>> {
    match value {
        Value::Array(items) => Ok(lock(items).clone()),
        Value::String(s) => Ok(s.chars().map(|c| Value::from(c.to_string())).collect()),
        other => Err(Exception::type_error(format!(
            "{} is not iterable",
            other.display()
        ))),
    }
}

/// Own enumerable entries, as object spread and `Object.keys` see them.
pub(crate) fn own_entries(value: &Value) -> Vec<(String, Value)> {
    match value {
        Value::Object(object) => lock(object).entries().to_vec(),
        Value::Array(items) => lock(items)
            .iter()
            .enumerate()
            .map(|(i, item)| (i.to_string(), item.clone()))
            .collect(),
        Value::String(s) => s
            .chars()
            .enumerate()
            .map(|(i, c)| (i.to_string(), Value::from(c.to_string())))
            .collect(),
        _ => Vec::new(),
    }
}

pub(crate) fn get_property(object: &Value, key: &str) -> Completion<Value> {
    match object {
        Value::Undefined | Value::Null => Err(Exception::type_error(format!(
            "Cannot read properties of {} (reading '{key}')",
            object.display()
        ))),
        Value::Object(obj) => Ok(lock(obj).get(key).cloned().unwrap_or(Value::Undefined)),
        Value::Array(items) => {
            if key == "length" {
                return Ok(Value::Number(lock(items).len() as f64));
            }
            if let Some(index) = array_index(key) {
                return Ok(lock(items).get(index).cloned().unwrap_or(Value::Undefined));
            }
            Ok(ArrayMethod::from_name(key).map_or(Value::Undefined, |method| {
                Value::bound(Builtin::Array(method), object.clone())
            }))
        }
        Value::String(s) => {
            if key == "length" {
                return Ok(Value::Number(s.chars().count() as f64));
            }
            if let Some(index) = array_index(key) {
                return Ok(s
                    .chars()
                    .nth(index)
                    .map_or(Value::Undefined, |c| Value::from(c.to_string())));
            }
            Ok(StringMethod::from_name(key).map_or(Value::Undefined, |method| {
                Value::bound(Builtin::Str(method), object.clone())
            }))
        }
        Value::Number(_) if key == "toFixed" => Ok(Value::bound(Builtin::ToFixed, object.clone())),
        Value::Promise(_) => Ok(match key {
            "then" => Value::bound(Builtin::Then, object.clone()),
            "catch" => Value::bound(Builtin::Catch, object.clone()),
            "finally" => Value::bound(Builtin::Finally, object.clone()),
            _ => Value::Undefined,
        }),
        _ if key == "toString" => Ok(Value::bound(Builtin::ValueToString, object.clone())),
        _ => Ok(Value::Undefined),
    }
}

pub(crate) fn set_property(object: &Value, key: &str, value: Value) -> Completion<()> {
    match object {
        Value::Undefined | Value::Null => Err(Exception::type_error(format!(
            "Cannot set properties of {} (setting '{key}')",
            object.display()
        ))),
        Value::Object(obj) => {
            lock(obj).set(key, value);
            Ok(())
        }
        Value::Array(items) => {
            let mut items = lock(items);
            if key == "length" {
                let len = value.to_number();
                if len < 0.0 || len.fract() != 0.0 || !len.is_finite() {
                    return Err(Exception::range_error("Invalid array length"));
                }
                items.resize(len as usize, Value::Undefined);
            } else if let Some(index) = array_index(key) {
                if index >= items.len() {
                    items.resize(index + 1, Value::Undefined);
                }
                items[index] = value;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

pub(crate) fn binary(op: BinaryOp, left: &Value, right: &Value) -> Value {
    match op {
        BinaryOp::Add => {
            let (l, r) = (left.to_primitive(), right.to_primitive());
            if matches!(l, Value::String(_)) || matches!(r, Value::String(_)) {
                Value::from(format!("{}{}", l.display(), r.display()))
            } else {
                Value::Number(l.to_number() + r.to_number())
            }
        }
        BinaryOp::Sub => Value::Number(left.to_number() - right.to_number()),
        BinaryOp::Mul => Value::Number(left.to_number() * right.to_number()),
        BinaryOp::Div => Value::Number(left.to_number() / right.to_number()),
        BinaryOp::Rem => Value::Number(left.to_number() % right.to_number()),
        BinaryOp::Eq => Value::Bool(left.loose_equals(right)),
        BinaryOp::NotEq => Value::Bool(!left.loose_equals(right)),
        BinaryOp::StrictEq => Value::Bool(left.strict_equals(right)),
        BinaryOp::StrictNotEq => Value::Bool(!left.strict_equals(right)),
        BinaryOp::Lt | BinaryOp::Gt | BinaryOp::LtEq | BinaryOp::GtEq => {
            let (l, r) = (left.to_primitive(), right.to_primitive());
            let ordering = match (&l, &r) {
                (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
                _ => l.to_number().partial_cmp(&r.to_number()),
            };
            let Some(ordering) = ordering else {
                return Value::Bool(false);
            };
            Value::Bool(match op {
                BinaryOp::Lt => ordering.is_lt(),
                BinaryOp::Gt => ordering.is_gt(),
                BinaryOp::LtEq => ordering.is_le(),
                _ => ordering.is_ge(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn const_bindings_reject_assignment() {
        let scope = Scope::root();
        scope.declare("x", Value::Number(1.0), DeclKind::Const).unwrap();
        let Err(Exception::Thrown(err)) = scope.assign("x", Value::Number(2.0)) else {
            panic!("expected a throw");
        };
        assert_eq!(err.display(), "TypeError: Assignment to constant variable.");
    }

    #[test]
    fn unknown_names_are_reference_errors() {
        let scope = Scope::child(&Scope::root());
        let Err(Exception::Thrown(err)) = scope.lookup("missing") else {
            panic!("expected a throw");
        };
        assert_eq!(err.display(), "ReferenceError: missing is not defined");
    }

    #[test]
    fn let_redeclaration_is_rejected() {
        let scope = Scope::root();
        scope.declare("x", Value::Null, DeclKind::Let).unwrap();
        assert!(scope.declare("x", Value::Null, DeclKind::Let).is_err());
        assert!(scope.declare("x", Value::Null, DeclKind::Var).is_ok());
    }

    #[test]
    fn addition_concatenates_when_either_side_is_a_string() {
        assert!(matches!(
            binary(BinaryOp::Add, &Value::from("a"), &Value::Number(1.0)),
            Value::String(s) if &*s == "a1"
        ));
        assert!(matches!(
            binary(BinaryOp::Add, &Value::Number(1.0), &Value::Bool(true)),
            Value::Number(n) if n == 2.0
        ));
    }

    #[test]
    fn comparisons_with_nan_are_false() {
        let nan = Value::Number(f64::NAN);
        assert!(!binary(BinaryOp::Lt, &nan, &Value::Number(1.0)).truthy());
        assert!(!binary(BinaryOp::GtEq, &nan, &Value::Number(1.0)).truthy());
    }

    #[test]
    fn array_length_and_index_assignment() {
        let array = Value::array(vec![Value::Number(1.0)]);
        set_property(&array, "2", Value::from("x")).unwrap();
        assert!(matches!(get_property(&array, "length").unwrap(), Value::Number(n) if n == 3.0));
        set_property(&array, "length", Value::Number(1.0)).unwrap();
        assert!(matches!(get_property(&array, "length").unwrap(), Value::Number(n) if n == 1.0));
    }
}
