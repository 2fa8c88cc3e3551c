//! Connect a server spec and a client spec: work out which variables must
//! cross between them and add stub definitions where one side reads a
//! variable only the other side defines.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::expr::Expression;
use crate::graph::{Namespace, Scope, ScopedVariable, Variable};
use crate::spec::{
    mark_inputs, scan_handler_inputs, scan_json_inputs, scan_object_inputs, ChartSpec,
    ChartVisitor, DataSpec, MarkSpec, SignalSpec, StringOrSignal,
};

/// Variables exchanged between the two halves of a planned spec.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommPlan {
    pub server_to_client: Vec<ScopedVariable>,
    pub client_to_server: Vec<ScopedVariable>,
}

pub(super) fn stitch(
    server: &mut ChartSpec,
    client: &mut ChartSpec,
    keep: &[ScopedVariable],
) -> Result<CommPlan> {
    let server_defs = Definitions::of(server)?;
    let client_defs = Definitions::of(client)?;
    let defined: BTreeSet<ScopedVariable> =
        server_defs.all.union(&client_defs.all).cloned().collect();

    let server_inputs = Reads::of(server)?.resolve(&defined);
    let client_inputs = Reads::of(client)?.resolve(&defined);

    let mut server_to_client: BTreeSet<ScopedVariable> = client_inputs
        .intersection(&server_defs.updates)
        .cloned()
        .collect();
    server_to_client.extend(
        keep.iter()
            .filter(|v| server_defs.updates.contains(*v))
            .cloned(),
    );

    // a variable both sides update is never sent
    let client_to_server: BTreeSet<ScopedVariable> = server_inputs
        .intersection(&client_defs.updates)
        .filter(|v| !server_defs.updates.contains(*v))
        .cloned()
        .collect();

    let server_stubs: Vec<_> = client_to_server.difference(&server_defs.all).cloned().collect();
    let client_stubs: Vec<_> = server_to_client.difference(&client_defs.all).cloned().collect();
    for var in server_stubs.iter().rev() {
        add_stub(var, server, client)?;
    }
    for var in client_stubs.iter().rev() {
        add_stub(var, client, server)?;
    }

    Ok(CommPlan {
        server_to_client: server_to_client.into_iter().collect(),
        client_to_server: client_to_server.into_iter().collect(),
    })
}

/// Define `var` in `to`, seeded with the literal value `from` holds for it.
fn add_stub(var: &ScopedVariable, to: &mut ChartSpec, from: &ChartSpec) -> Result<()> {
    let (name, scope) = (var.name(), &var.scope);
    match var.namespace() {
        Namespace::Signal => {
            let value = from
                .get_nested_signal(scope, name)
                .ok()
                .and_then(|s| s.value.clone());
            to.add_nested_signal(scope, SignalSpec::literal(name, value), Some(0))
        }
        Namespace::Data => {
            to.add_nested_data(scope, DataSpec::stub(name, None), Some(0))
        }
    }
}

/// Resolve a reference against a set of definitions: the scope itself,
/// then each enclosing scope.
pub(super) fn resolve_in(
    defined: &BTreeSet<ScopedVariable>,
    var: &Variable,
    scope: &Scope,
) -> Option<ScopedVariable> {
    scope
        .ancestors()
        .map(|s| var.clone().scoped(s))
        .find(|v| defined.contains(v))
}

#[derive(Default)]
pub(super) struct Definitions {
    pub all: BTreeSet<ScopedVariable>,
    /// Definitions whose value is computed or changes at runtime.
    pub updates: BTreeSet<ScopedVariable>,
}

impl Definitions {
    pub fn of(spec: &ChartSpec) -> Result<Self> {
        let mut defs = Self::default();
        spec.walk(&mut defs)?;
        Ok(defs)
    }
}

impl ChartVisitor for Definitions {
    fn visit_data(&mut self, data: &DataSpec, scope: &Scope) -> Result<()> {
        let var = Variable::data(data.name.clone()).scoped(scope.clone());
        let computed = data.source.is_some()
            || data.url.is_some()
            || !data.transform.is_empty()
            || data.on.is_some();
        if computed {
            self.updates.insert(var.clone());
        }
        self.all.insert(var);
        for name in data.transform.iter().flat_map(|tx| tx.output_signals()) {
            let var = Variable::signal(name).scoped(scope.clone());
            self.updates.insert(var.clone());
            self.all.insert(var);
        }
        Ok(())
    }

    fn visit_signal(&mut self, signal: &SignalSpec, scope: &Scope) -> Result<()> {
        if !signal.is_definition() {
            return Ok(());
        }
        let var = Variable::signal(signal.name.clone()).scoped(scope.clone());
        if !signal.is_literal() {
            self.updates.insert(var.clone());
        }
        self.all.insert(var);
        Ok(())
    }
}

/// Unresolved references, each with the scope it was made from.
#[derive(Default)]
pub(super) struct Reads(Vec<(Variable, Scope)>);

impl Reads {
    pub fn of(spec: &ChartSpec) -> Result<Self> {
        let mut reads = Self::default();
        let mut root = Vec::new();
        scan_object_inputs(&spec.extra, &mut root);
        reads.push(root, &Scope::root());
        spec.walk(&mut reads)?;
        Ok(reads)
    }

    fn push(&mut self, vars: Vec<Variable>, scope: &Scope) {
        self.0.extend(vars.into_iter().map(|v| (v, scope.clone())));
    }

    pub fn resolve(&self, defined: &BTreeSet<ScopedVariable>) -> BTreeSet<ScopedVariable> {
        self.0
            .iter()
            .filter_map(|(var, scope)| resolve_in(defined, var, scope))
            .collect()
    }
}

fn expression_inputs(src: &str) -> Vec<Variable> {
    Expression::parse(src)
        .map(|e| e.input_vars())
        .unwrap_or_default()
}

impl ChartVisitor for Reads {
    fn visit_data(&mut self, data: &DataSpec, scope: &Scope) -> Result<()> {
        let mut vars: Vec<Variable> = data.sources().into_iter().map(Variable::data).collect();
        if let Some(StringOrSignal::Signal(r)) = &data.url {
            vars.extend(expression_inputs(&r.signal));
        }
        let mut published: Vec<Variable> = Vec::new();
        for tx in &data.transform {
            vars.extend(tx.input_vars().into_iter().filter(|v| !published.contains(v)));
            published.extend(tx.output_signals().into_iter().map(Variable::signal));
        }
        if let Some(on) = &data.on {
            scan_json_inputs(on, &mut vars);
        }
        self.push(vars, scope);
        Ok(())
    }

    fn visit_signal(&mut self, signal: &SignalSpec, scope: &Scope) -> Result<()> {
        let mut vars = Vec::new();
        scan_handler_inputs(&signal.on, &mut vars);
        if !signal.is_definition() {
            // pushes to the enclosing definition
            let outer = scope.parent().unwrap_or_default();
            self.push(vec![Variable::signal(signal.name.clone())], &outer);
        } else if let Some(src) = signal.expression() {
            vars.extend(expression_inputs(src));
        }
        self.push(vars, scope);
        Ok(())
    }

    fn visit_group_mark(&mut self, mark: &MarkSpec, scope: &Scope) -> Result<()> {
        self.push(mark_inputs(mark), scope);
        Ok(())
    }

    fn visit_non_group_mark(&mut self, mark: &MarkSpec, scope: &Scope) -> Result<()> {
        self.push(mark_inputs(mark), scope);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn spec(value: serde_json::Value) -> ChartSpec {
        ChartSpec::from_value(value).unwrap()
    }

    #[test]
    fn server_values_read_by_the_client_are_sent() {
        let mut server = spec(json!({
            "data": [{"name": "counts", "url": "table://orders", "transform": [
                {"type": "aggregate", "groupby": ["k"]}
            ]}]
        }));
        let mut client = spec(json!({
            "marks": [{"type": "rect", "from": {"data": "counts"}}]
        }));
        let plan = stitch(&mut server, &mut client, &[]).unwrap();
        assert_eq!(
            plan.server_to_client,
            vec![Variable::data("counts").scoped(Scope::root())]
        );
        assert!(plan.client_to_server.is_empty());
        // the client received a stub to hold the values
        assert_eq!(client.data[0].name, "counts");
        assert!(client.data[0].values.is_none());
    }

    #[test]
    fn client_driven_inputs_are_stubbed_on_the_server() {
        let mut server = spec(json!({
            "data": [{"name": "picked", "url": "table://orders", "transform": [
                {"type": "filter", "expr": "datum.k == brush"}
            ]}]
        }));
        let mut client = spec(json!({
            "signals": [{"name": "brush", "value": 1, "on": [{"events": "click", "update": "2"}]}],
            "data": [{"name": "picked"}],
            "marks": [{"type": "rect", "from": {"data": "picked"}}]
        }));
        let plan = stitch(&mut server, &mut client, &[]).unwrap();
        assert_eq!(
            plan.client_to_server,
            vec![Variable::signal("brush").scoped(Scope::root())]
        );
        assert_eq!(server.signals[0].name, "brush");
        assert_eq!(server.signals[0].value, Some(json!(1)));
        assert!(server.signals[0].on.is_empty());
    }

    #[test]
    fn kept_variables_are_sent_even_if_unread() {
        let mut server = spec(json!({
            "signals": [{"name": "total", "update": "1 + 1"}]
        }));
        let mut client = spec(json!({}));
        let keep = [Variable::signal("total").scoped(Scope::root())];
        let plan = stitch(&mut server, &mut client, &keep).unwrap();
        assert_eq!(plan.server_to_client, keep.to_vec());
        assert_eq!(client.signals[0].name, "total");
    }

    #[test]
    fn nested_reads_resolve_to_enclosing_definitions() {
        let mut defined = BTreeSet::new();
        defined.insert(Variable::data("rows").scoped(Scope::root()));
        defined.insert(Variable::data("rows").scoped(Scope::new(vec![1])));
        let var = Variable::data("rows");
        assert_eq!(
            resolve_in(&defined, &var, &Scope::new(vec![0, 2])),
            Some(var.clone().scoped(Scope::root()))
        );
        assert_eq!(
            resolve_in(&defined, &var, &Scope::new(vec![1, 0])),
            Some(var.clone().scoped(Scope::new(vec![1])))
        );
    }
}
