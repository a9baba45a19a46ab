//! Dependency graph between transactions of one chain
//!
//! Edges `dependency -> dependent` are grouped by a graph id so resolving
//! one transaction only loads its connected component. Resolution walks
//! the pending ancestors of a candidate in topological order and returns
//! the transaction that needs attention first.

use crate::error::{RelayerError, RelayerResult};
use crate::model::{Dependency, Transaction, TxKind, TxState};
use crate::state::Store;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Hard ceiling of the ancestor walk
pub const MAX_DEPTH: usize = 32;

/// Kahn topological sort of `nodes` under `edges` (`(dependency, dependent)`).
///
/// Ties are broken by the order of `nodes`. Returns one node of a cycle
/// when the edges are not acyclic.
pub fn topological_order(nodes: &[Uuid], edges: &[(Uuid, Uuid)]) -> Result<Vec<Uuid>, Uuid> {
    let mut incoming: HashMap<Uuid, usize> = nodes.iter().map(|n| (*n, 0)).collect();
    let mut outgoing: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
    for (from, to) in edges {
        *incoming.entry(*to).or_default() += 1;
        incoming.entry(*from).or_default();
        outgoing.entry(*from).or_default().push(*to);
    }

    let position: HashMap<Uuid, usize> = nodes.iter().enumerate().map(|(i, n)| (*n, i)).collect();
    let rank = |id: &Uuid| position.get(id).copied().unwrap_or(usize::MAX);

    let mut ready: Vec<Uuid> = incoming
        .iter()
        .filter(|(_, count)| **count == 0)
        .map(|(id, _)| *id)
        .collect();
    ready.sort_by_key(|id| std::cmp::Reverse(rank(id)));

    let mut order = Vec::with_capacity(incoming.len());
    while let Some(node) = ready.pop() {
        order.push(node);
        for next in outgoing.get(&node).into_iter().flatten() {
            if let Some(count) = incoming.get_mut(next) {
                *count -= 1;
                if *count == 0 {
                    ready.push(*next);
                    ready.sort_by_key(|id| std::cmp::Reverse(rank(id)));
                }
            }
        }
    }

    if order.len() < incoming.len() {
        let sorted: HashSet<Uuid> = order.iter().copied().collect();
        let stuck = incoming
            .keys()
            .find(|id| !sorted.contains(id))
            .copied()
            .unwrap_or_default();
        return Err(stuck);
    }
    Ok(order)
}

/// Snapshot of one connected component, taken at resolution time
struct Component {
    transactions: HashMap<Uuid, Transaction>,
    /// dependent -> dependencies still pending, in topological order
    pending: HashMap<Uuid, Vec<Uuid>>,
}

impl Component {
    fn get(&self, id: &Uuid) -> RelayerResult<&Transaction> {
        self.transactions
            .get(id)
            .ok_or_else(|| RelayerError::TransactionNotFound {
                tx_id: id.to_string(),
            })
    }

    /// Walk the pending ancestors of `tx_id`. `ascendency` holds the
    /// transactions visited so far, root first.
    fn walk(
        &self,
        root: Uuid,
        tx_id: Uuid,
        ascendency: &[Uuid],
        depth: usize,
    ) -> RelayerResult<Transaction> {
        if depth > MAX_DEPTH {
            return Err(RelayerError::DependencyDepth { tx_id: root });
        }

        let tx = self.get(&tx_id)?;
        let pending = self.pending.get(&tx_id).map(Vec::as_slice).unwrap_or(&[]);

        for dependency_id in pending {
            let dependency = self.get(dependency_id)?;
            let mut chain = Vec::with_capacity(ascendency.len() + 1);
            chain.push(dependency.id);
            chain.extend_from_slice(ascendency);

            match dependency.state {
                TxState::Done => continue,
                TxState::Aborted => {
                    return Err(RelayerError::AbortedDependency {
                        dependency: dependency.id,
                        ascendency: chain,
                    });
                }
                TxState::Retry => return Ok(dependency.clone()),
                TxState::Deploy | TxState::Deleted => {
                    if let Some(contract) = self.undeployed_contract(dependency)? {
                        if contract.state.is_excluded() {
                            return Err(RelayerError::ExcludedDependency {
                                dependency: contract.id,
                                state: contract.state.to_string(),
                            });
                        }
                        let mut contract_chain = vec![contract.id];
                        contract_chain.extend_from_slice(&chain);
                        return self.walk(root, contract.id, &contract_chain, depth + 1);
                    }
                    return self.walk(root, dependency.id, &chain, depth + 1);
                }
                state => {
                    return Err(RelayerError::ExcludedDependency {
                        dependency: dependency.id,
                        state: state.to_string(),
                    });
                }
            }
        }

        Ok(tx.clone())
    }

    /// Target contract of a call when it has no address yet
    fn undeployed_contract(&self, tx: &Transaction) -> RelayerResult<Option<&Transaction>> {
        if tx.kind != TxKind::Function {
            return Ok(None);
        }
        match tx.contract {
            Some(contract_id) => {
                let contract = self.get(&contract_id)?;
                Ok((!contract.is_deployed()).then_some(contract))
            }
            None => Ok(None),
        }
    }
}

/// Dependency edges persisted in the store
pub struct DependencyGraph {
    store: Arc<dyn Store>,
}

impl DependencyGraph {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Require `dependency` to be deployed before `dependent`.
    ///
    /// The edge joins the dependent's graph, else the dependency's graph,
    /// else a new graph named after the dependent. Two existing graphs are
    /// merged into the dependent's.
    pub async fn add(&self, dependent: &Transaction, dependency: &Transaction) -> RelayerResult<Dependency> {
        if dependent.id == dependency.id {
            return Err(RelayerError::DependencyCycle {
                tx_id: dependent.id,
            });
        }

        let dependent_graph = self.store.graph_of(dependent.id).await?;
        let dependency_graph = self.store.graph_of(dependency.id).await?;

        let mut edges = Vec::new();
        for graph in [dependent_graph, dependency_graph].into_iter().flatten() {
            edges.extend(self.store.graph_edges(graph).await?);
        }
        if Self::reaches(&edges, dependent.id, dependency.id) {
            warn!(
                "Refusing dependency {} -> {}: cycle",
                dependency.id, dependent.id
            );
            return Err(RelayerError::DependencyCycle {
                tx_id: dependent.id,
            });
        }

        let graph = dependent_graph.or(dependency_graph).unwrap_or(dependent.id);
        if let (Some(into), Some(from)) = (dependent_graph, dependency_graph) {
            if into != from {
                debug!("Merging dependency graph {} into {}", from, into);
                self.store.merge_graphs(from, into).await?;
            }
        }

        let edge = Dependency::new(dependency.id, dependent.id, graph);
        self.store.insert_dependency(&edge).await?;
        debug!(
            "Added dependency {} -> {} in graph {}",
            dependency.id, dependent.id, graph
        );
        Ok(edge)
    }

    /// Whether `to` is reachable from `from` following dependency -> dependent
    fn reaches(edges: &[Dependency], from: Uuid, to: Uuid) -> bool {
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([from]);
        while let Some(node) = queue.pop_front() {
            if node == to {
                return true;
            }
            if !seen.insert(node) {
                continue;
            }
            queue.extend(
                edges
                    .iter()
                    .filter(|e| e.dependency == node)
                    .map(|e| e.dependent),
            );
        }
        false
    }

    /// The transaction that must be dealt with before `tx`, `tx` itself
    /// when every dependency is satisfied.
    ///
    /// Fails with `AbortedDependency` when an ancestor is aborted, its
    /// `ascendency` listing the aborted ancestor first and `tx` last, and
    /// with `ExcludedDependency` when an ancestor is in a state that keeps
    /// `tx` waiting.
    pub async fn resolve(&self, tx: &Transaction) -> RelayerResult<Transaction> {
        let graph = match self.store.graph_of(tx.id).await? {
            Some(graph) => graph,
            None => return Ok(tx.clone()),
        };

        let component = self.load(graph, tx).await?;
        component.walk(tx.id, tx.id, &[tx.id], 0)
    }

    async fn load(&self, graph: Uuid, tx: &Transaction) -> RelayerResult<Component> {
        let edges = self.store.graph_edges(graph).await?;

        let mut ids: Vec<Uuid> = edges
            .iter()
            .flat_map(|e| [e.dependency, e.dependent])
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        let mut transactions: HashMap<Uuid, Transaction> = self
            .store
            .get_transactions(&ids)
            .await?
            .into_iter()
            .map(|t| (t.id, t))
            .collect();
        transactions.insert(tx.id, tx.clone());

        // Target contracts outside the component
        let missing: Vec<Uuid> = transactions
            .values()
            .filter_map(|t| t.contract)
            .filter(|id| !transactions.contains_key(id))
            .collect();
        if !missing.is_empty() {
            for contract in self.store.get_transactions(&missing).await? {
                transactions.insert(contract.id, contract);
            }
        }

        ids.sort_by_key(|id| transactions.get(id).map(|t| t.created_at));

        let state_of = |id: &Uuid| transactions.get(id).map(|t| t.state);
        let active: Vec<(Uuid, Uuid)> = edges
            .iter()
            .filter(|e| state_of(&e.dependent) != Some(TxState::Done))
            .filter(|e| state_of(&e.dependency) != Some(TxState::Done))
            .map(|e| (e.dependency, e.dependent))
            .collect();

        let order = topological_order(&ids, &active)
            .map_err(|tx_id| RelayerError::DependencyCycle { tx_id })?;
        let position: HashMap<Uuid, usize> =
            order.iter().enumerate().map(|(i, id)| (*id, i)).collect();

        let mut pending: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
        for (dependency, dependent) in &active {
            pending.entry(*dependent).or_default().push(*dependency);
        }
        for dependencies in pending.values_mut() {
            dependencies.sort_by_key(|id| position.get(id).copied().unwrap_or(usize::MAX));
        }

        Ok(Component {
            transactions,
            pending,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::MemoryStore;

    struct Fixture {
        store: Arc<MemoryStore>,
        graph: DependencyGraph,
    }

    impl Fixture {
        fn new() -> Self {
            let store = Arc::new(MemoryStore::new());
            let graph = DependencyGraph::new(store.clone());
            Self { store, graph }
        }

        async fn tx(&self, kind: TxKind, state: TxState) -> Transaction {
            let mut tx = Transaction::new(1, kind);
            tx.state = state;
            self.store.insert_transaction(&tx).await.unwrap();
            tx
        }

        async fn set_state(&self, tx: &Transaction, state: TxState) {
            let mut tx = self.store.get_transaction(tx.id).await.unwrap();
            tx.state = state;
            self.store.save_transaction(&tx).await.unwrap();
        }

        async fn resolve(&self, tx: &Transaction) -> RelayerResult<Transaction> {
            let current = self.store.get_transaction(tx.id).await.unwrap();
            self.graph.resolve(&current).await
        }
    }

    #[test]
    fn test_topological_order_detects_cycles() {
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let order = topological_order(&[c, b, a], &[(a, b), (b, c)]).unwrap();
        assert_eq!(order, vec![a, b, c]);

        assert!(topological_order(&[a, b], &[(a, b), (b, a)]).is_err());
    }

    #[tokio::test]
    async fn test_diamond_resolves_in_order() {
        let f = Fixture::new();
        let a = f.tx(TxKind::Contract, TxState::Deploy).await;
        let b = f.tx(TxKind::Contract, TxState::Deploy).await;
        let c = f.tx(TxKind::Contract, TxState::Deploy).await;
        let d = f.tx(TxKind::Contract, TxState::Deploy).await;

        f.graph.add(&b, &a).await.unwrap();
        f.graph.add(&c, &a).await.unwrap();
        f.graph.add(&d, &b).await.unwrap();
        f.graph.add(&d, &c).await.unwrap();

        assert_eq!(f.resolve(&d).await.unwrap().id, a.id);

        f.set_state(&a, TxState::Done).await;
        let next = f.resolve(&d).await.unwrap().id;
        assert!(next == b.id || next == c.id);

        f.set_state(&b, TxState::Done).await;
        assert_eq!(f.resolve(&d).await.unwrap().id, c.id);

        f.set_state(&c, TxState::Done).await;
        assert_eq!(f.resolve(&d).await.unwrap().id, d.id);
    }

    #[tokio::test]
    async fn test_aborted_ancestor_names_whole_chain() {
        let f = Fixture::new();
        let a = f.tx(TxKind::Contract, TxState::Aborted).await;
        let b = f.tx(TxKind::Contract, TxState::Deploy).await;
        let c = f.tx(TxKind::Contract, TxState::Deploy).await;
        f.graph.add(&b, &a).await.unwrap();
        f.graph.add(&c, &b).await.unwrap();

        match f.resolve(&c).await {
            Err(RelayerError::AbortedDependency {
                dependency,
                ascendency,
            }) => {
                assert_eq!(dependency, a.id);
                assert_eq!(ascendency, vec![a.id, b.id, c.id]);
            }
            other => panic!("expected abort, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_retry_dependency_is_returned() {
        let f = Fixture::new();
        let a = f.tx(TxKind::Contract, TxState::Retry).await;
        let b = f.tx(TxKind::Contract, TxState::Deploy).await;
        f.graph.add(&b, &a).await.unwrap();

        assert_eq!(f.resolve(&b).await.unwrap().id, a.id);
    }

    #[tokio::test]
    async fn test_in_flight_dependency_excludes() {
        let f = Fixture::new();
        let a = f.tx(TxKind::Contract, TxState::Deploying).await;
        let b = f.tx(TxKind::Contract, TxState::Deploy).await;
        f.graph.add(&b, &a).await.unwrap();

        assert!(matches!(
            f.resolve(&b).await,
            Err(RelayerError::ExcludedDependency { .. })
        ));
    }

    #[tokio::test]
    async fn test_call_dependency_resolves_to_its_contract() {
        let f = Fixture::new();
        let contract = f.tx(TxKind::Contract, TxState::Deploy).await;
        let mut call = Transaction::new(1, TxKind::Function);
        call.contract = Some(contract.id);
        f.store.insert_transaction(&call).await.unwrap();
        let later = f.tx(TxKind::Contract, TxState::Deploy).await;

        f.graph.add(&later, &call).await.unwrap();
        assert_eq!(f.resolve(&later).await.unwrap().id, contract.id);

        f.set_state(&contract, TxState::Held).await;
        assert!(matches!(
            f.resolve(&later).await,
            Err(RelayerError::ExcludedDependency { dependency, .. }) if dependency == contract.id
        ));
    }

    #[tokio::test]
    async fn test_cycles_are_rejected_and_graphs_merge() {
        let f = Fixture::new();
        let a = f.tx(TxKind::Contract, TxState::Deploy).await;
        let b = f.tx(TxKind::Contract, TxState::Deploy).await;
        let c = f.tx(TxKind::Contract, TxState::Deploy).await;
        let d = f.tx(TxKind::Contract, TxState::Deploy).await;

        let ab = f.graph.add(&b, &a).await.unwrap();
        assert_eq!(ab.graph, b.id);
        assert!(matches!(
            f.graph.add(&a, &b).await,
            Err(RelayerError::DependencyCycle { .. })
        ));
        assert!(f.graph.add(&a, &a).await.is_err());

        let cd = f.graph.add(&d, &c).await.unwrap();
        assert_eq!(cd.graph, d.id);

        // b's graph absorbs d's
        f.graph.add(&b, &d).await.unwrap();
        assert_eq!(f.store.graph_edges(b.id).await.unwrap().len(), 3);
        assert!(f.store.graph_edges(d.id).await.unwrap().is_empty());
        assert_eq!(f.resolve(&b).await.unwrap().id, a.id);
    }

    #[tokio::test]
    async fn test_unrelated_transaction_resolves_to_itself() {
        let f = Fixture::new();
        let a = f.tx(TxKind::Transfer, TxState::Deploy).await;
        assert_eq!(f.resolve(&a).await.unwrap().id, a.id);
    }
}
