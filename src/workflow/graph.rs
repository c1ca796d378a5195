//! 工具调用依赖图
//!
//! 使用邻接表和入度表实现分层拓扑排序；深度优先三色标记检测依赖环。

use std::collections::{HashMap, HashSet};

use crate::core::{CallId, OrchestrationError};
use crate::tools::ToolRegistry;
use crate::workflow::{ExecutionPhase, OrchestrationContext, ToolCall};

#[derive(Clone, Copy, PartialEq, Eq)]
enum Color {
    White,
    Gray,
    Black,
}

/// 单次运行的依赖图
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    /// 调用提交顺序
    order: Vec<CallId>,
    /// 调用 ID -> 前置调用
    prerequisites: HashMap<CallId, Vec<CallId>>,
    /// 邻接表：调用 ID -> 依赖它的调用
    dependents: HashMap<CallId, Vec<CallId>>,
}

impl DependencyGraph {
    fn with_nodes<I>(ids: I) -> Self
    where
        I: IntoIterator<Item = CallId>,
    {
        let mut graph = Self::default();
        for id in ids {
            if graph.prerequisites.contains_key(&id) {
                continue;
            }
            graph.prerequisites.insert(id.clone(), Vec::new());
            graph.dependents.insert(id.clone(), Vec::new());
            graph.order.push(id);
        }
        graph
    }

    /// 按工具声明的依赖（工具名）解析为同批次内的调用 ID
    pub fn build(calls: &[ToolCall], registry: &ToolRegistry, ctx: &OrchestrationContext) -> Self {
        let mut graph = Self::with_nodes(calls.iter().map(|c| c.id.clone()));

        let mut by_name: HashMap<&str, Vec<&str>> = HashMap::new();
        for call in calls {
            by_name
                .entry(call.tool_name.as_str())
                .or_default()
                .push(call.id.as_str());
        }

        for call in calls {
            let Some(tool) = registry.get(&call.tool_name) else {
                continue;
            };
            for dep_name in tool.dependencies(&call.input, ctx) {
                match by_name.get(dep_name.as_str()) {
                    Some(ids) => {
                        for dep_id in ids.iter().filter(|id| **id != call.id) {
                            graph.add_edge(dep_id, &call.id);
                        }
                    }
                    None => tracing::debug!(
                        call_id = %call.id,
                        tool = %call.tool_name,
                        dependency = %dep_name,
                        "Declared dependency has no call in this batch, ignoring"
                    ),
                }
            }
        }

        graph
    }

    /// 由显式边构建：(前置, 依赖方)
    pub fn from_edges<I, S>(ids: I, edges: &[(&str, &str)]) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<CallId>,
    {
        let mut graph = Self::with_nodes(ids.into_iter().map(Into::into));
        for (prerequisite, dependent) in edges {
            graph.add_edge(prerequisite, dependent);
        }
        graph
    }

    /// 添加边；未知节点会被补充登记，重复边忽略
    pub fn add_edge(&mut self, prerequisite: &str, dependent: &str) {
        for id in [prerequisite, dependent] {
            if !self.prerequisites.contains_key(id) {
                self.prerequisites.insert(id.to_string(), Vec::new());
                self.dependents.insert(id.to_string(), Vec::new());
                self.order.push(id.to_string());
            }
        }
        let prereqs = self.prerequisites.entry(dependent.to_string()).or_default();
        if prereqs.iter().any(|p| p == prerequisite) {
            return;
        }
        prereqs.push(prerequisite.to_string());
        self.dependents
            .entry(prerequisite.to_string())
            .or_default()
            .push(dependent.to_string());
    }

    pub fn prerequisites_of(&self, id: &str) -> &[CallId] {
        self.prerequisites.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn dependents_of(&self, id: &str) -> &[CallId] {
        self.dependents.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// 查找依赖环，返回环路（首节点在末尾重复）
    pub fn find_cycle(&self) -> Option<Vec<CallId>> {
        let mut color: HashMap<&str, Color> =
            self.order.iter().map(|id| (id.as_str(), Color::White)).collect();
        let mut stack: Vec<&str> = Vec::new();

        for id in &self.order {
            if color.get(id.as_str()) == Some(&Color::White) {
                if let Some(cycle) = self.visit(id, &mut color, &mut stack) {
                    return Some(cycle);
                }
            }
        }
        None
    }

    fn visit<'a>(
        &'a self,
        id: &'a str,
        color: &mut HashMap<&'a str, Color>,
        stack: &mut Vec<&'a str>,
    ) -> Option<Vec<CallId>> {
        color.insert(id, Color::Gray);
        stack.push(id);

        for next in self.dependents_of(id) {
            match color.get(next.as_str()).copied().unwrap_or(Color::White) {
                Color::Gray => {
                    let start = stack.iter().position(|n| *n == next.as_str()).unwrap_or(0);
                    let mut cycle: Vec<CallId> = stack[start..].iter().map(|s| s.to_string()).collect();
                    cycle.push(next.clone());
                    return Some(cycle);
                }
                Color::White => {
                    if let Some(cycle) = self.visit(next, color, stack) {
                        return Some(cycle);
                    }
                }
                Color::Black => {}
            }
        }

        stack.pop();
        color.insert(id, Color::Black);
        None
    }

    /// 分层拓扑排序：同层调用互不依赖，可并发执行
    pub fn phases(&self) -> Result<Vec<ExecutionPhase>, OrchestrationError> {
        if let Some(cycle) = self.find_cycle() {
            return Err(OrchestrationError::DependencyCycle { cycle });
        }

        let position: HashMap<&str, usize> = self
            .order
            .iter()
            .enumerate()
            .map(|(i, id)| (id.as_str(), i))
            .collect();
        let mut in_degree: HashMap<&str, usize> = self
            .order
            .iter()
            .map(|id| (id.as_str(), self.prerequisites_of(id).len()))
            .collect();

        let mut phases = Vec::new();
        let mut placed: HashSet<&str> = HashSet::new();
        let mut current: Vec<&str> = self
            .order
            .iter()
            .map(String::as_str)
            .filter(|id| in_degree.get(id) == Some(&0))
            .collect();

        while !current.is_empty() {
            let mut next: Vec<&str> = Vec::new();
            for id in &current {
                placed.insert(*id);
                for dependent in self.dependents_of(id) {
                    if let Some(degree) = in_degree.get_mut(dependent.as_str()) {
                        *degree = degree.saturating_sub(1);
                        if *degree == 0 {
                            next.push(dependent.as_str());
                        }
                    }
                }
            }
            phases.push(ExecutionPhase {
                index: phases.len(),
                call_ids: current.iter().map(|s| s.to_string()).collect(),
            });
            next.sort_by_key(|id| position.get(id).copied().unwrap_or(usize::MAX));
            next.dedup();
            current = next;
        }

        debug_assert_eq!(placed.len(), self.order.len());
        Ok(phases)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::Value;

    use crate::core::ToolError;
    use crate::tools::Tool;

    fn phase_index(phases: &[ExecutionPhase], id: &str) -> usize {
        phases
            .iter()
            .find(|p| p.call_ids.iter().any(|c| c == id))
            .map(|p| p.index)
            .unwrap()
    }

    #[test]
    fn test_independent_calls_share_first_phase() {
        let graph = DependencyGraph::from_edges(["a", "b"], &[]);
        let phases = graph.phases().unwrap();
        assert_eq!(phases.len(), 1);
        assert_eq!(phases[0].call_ids, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_diamond_layers() {
        let graph = DependencyGraph::from_edges(
            ["a", "b", "c", "d"],
            &[("a", "b"), ("a", "c"), ("b", "d"), ("c", "d")],
        );
        let phases = graph.phases().unwrap();
        assert_eq!(phases.len(), 3);
        assert_eq!(phases[1].call_ids, vec!["b".to_string(), "c".to_string()]);
        for (id, deps) in [("b", vec!["a"]), ("c", vec!["a"]), ("d", vec!["b", "c"])] {
            for dep in deps {
                assert!(phase_index(&phases, id) > phase_index(&phases, dep));
            }
        }
    }

    #[test]
    fn test_every_call_after_its_prerequisites() {
        let edges = [
            ("c1", "c3"),
            ("c2", "c3"),
            ("c3", "c5"),
            ("c4", "c5"),
            ("c0", "c4"),
            ("c1", "c6"),
            ("c5", "c6"),
        ];
        let graph = DependencyGraph::from_edges(["c0", "c1", "c2", "c3", "c4", "c5", "c6"], &edges);
        let phases = graph.phases().unwrap();
        for (pre, dep) in edges {
            assert!(phase_index(&phases, dep) > phase_index(&phases, pre));
        }
        let total: usize = phases.iter().map(|p| p.call_ids.len()).sum();
        assert_eq!(total, 7);
    }

    #[test]
    fn test_cycle_is_reported_deterministically() {
        let graph = DependencyGraph::from_edges(["a", "b", "c"], &[("a", "b"), ("b", "c"), ("c", "a")]);
        let first = graph.phases().unwrap_err();
        let second = graph.phases().unwrap_err();
        assert_eq!(first, second);
        match first {
            OrchestrationError::DependencyCycle { cycle } => {
                assert_eq!(cycle, vec!["a", "b", "c", "a"]);
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn test_duplicate_edges_are_ignored() {
        let graph = DependencyGraph::from_edges(["a", "b"], &[("a", "b"), ("a", "b")]);
        assert_eq!(graph.prerequisites_of("b"), &["a".to_string()]);
        assert_eq!(graph.dependents_of("a"), &["b".to_string()]);
    }

    struct NamedTool {
        name: &'static str,
        deps: Vec<String>,
    }

    #[async_trait]
    impl Tool for NamedTool {
        fn name(&self) -> &str {
            self.name
        }

        fn dependencies(&self, _input: &Value, _ctx: &OrchestrationContext) -> Vec<String> {
            self.deps.clone()
        }

        async fn execute(&self, _input: &Value, _ctx: &OrchestrationContext) -> Result<Value, ToolError> {
            Ok(Value::Null)
        }
    }

    #[test]
    fn test_build_resolves_tool_names_to_call_ids() {
        let registry = ToolRegistry::new()
            .with(NamedTool {
                name: "generateMealPlan",
                deps: vec![],
            })
            .with(NamedTool {
                name: "generateGroceryList",
                deps: vec!["generateMealPlan".into(), "notInBatch".into()],
            });
        let calls = vec![
            ToolCall::with_id("list", "generateGroceryList", Value::Null),
            ToolCall::with_id("plan", "generateMealPlan", Value::Null),
            ToolCall::with_id("ghost", "unregistered", Value::Null),
        ];
        let ctx = OrchestrationContext::new("u1", "s1");
        let graph = DependencyGraph::build(&calls, &registry, &ctx);

        assert_eq!(graph.prerequisites_of("list"), &["plan".to_string()]);
        assert!(graph.prerequisites_of("ghost").is_empty());

        let phases = graph.phases().unwrap();
        assert_eq!(phases[0].call_ids, vec!["plan".to_string(), "ghost".to_string()]);
        assert_eq!(phases[1].call_ids, vec!["list".to_string()]);
    }

    #[test]
    fn test_self_dependency_is_not_an_edge() {
        let registry = ToolRegistry::new().with(NamedTool {
            name: "searchRecipes",
            deps: vec!["searchRecipes".into()],
        });
        let calls = vec![ToolCall::with_id("only", "searchRecipes", Value::Null)];
        let ctx = OrchestrationContext::new("u1", "s1");
        let graph = DependencyGraph::build(&calls, &registry, &ctx);
        assert_eq!(graph.phases().unwrap().len(), 1);
    }
}
