// platform.rs — In-memory hardware platform description
//
// A bipartite component graph: cores and memories as nodes, access paths as
// edges. Core↔memory edges carry per-access read and write costs;
// memory↔memory edges carry a fix cost, a per-byte cost and the DMA
// controllers driving the transfer. Groups aggregate cores and memories into
// clusters. How this structure is obtained (platform XML or otherwise) is a
// collaborator's concern.

use std::collections::HashMap;

use crate::graph::{Graph, NodeId};

/// Cache geometry of the target cores.
#[derive(Debug, Clone, Copy)]
pub struct CacheConfig {
    /// Bytes fetched and stored per cache entry.
    pub word_size: i64,
    /// Number of entries that can share the same cache index.
    pub associativity: i64,
    /// Number of cache indices (line_count × associativity = total entries).
    pub line_count: i64,
}

/// Bank layout of one cluster.
#[derive(Debug, Clone, Copy)]
pub struct Cluster {
    pub cores: usize,
    pub banks: usize,
    pub bank_size: i64,
}

#[derive(Debug)]
pub struct CoreType {
    pub name: String,
}

#[derive(Debug)]
pub struct Core {
    pub name: String,
    pub core_type: usize,
    pub node: NodeId,
    pub groups: Vec<usize>,
    pub index: usize,
}

#[derive(Debug)]
pub struct DmaController {
    pub name: String,
    pub index: usize,
}

#[derive(Debug)]
pub struct Memory {
    pub name: String,
    pub size: i64,
    pub node: NodeId,
    pub groups: Vec<usize>,
    pub index: usize,
}

#[derive(Debug, Default)]
pub struct HwGroup {
    pub cores: Vec<usize>,
    pub memories: Vec<usize>,
    pub total_mem: i64,
    pub index: usize,
}

/// Node payload of the component graph.
#[derive(Debug, Clone, Copy)]
pub enum Component {
    Core(usize),
    Memory(usize),
}

/// Edge payload of the component graph.
#[derive(Debug, Clone, Default)]
pub struct HwConnection {
    /// Fix cost of a DMA transfer (initialisation etc.). Zero core↔memory.
    pub fix_cost: i64,
    /// Cost of one read access (memory to core). Zero for DMA.
    pub read_cost: i64,
    /// Cost of one write access, or of transferring one byte (DMA).
    pub write_cost: i64,
    /// DMA controllers carrying the transfer. Empty core↔memory; one for a
    /// plain DMA transfer, two when sender and receiver engines differ.
    pub controllers: Vec<usize>,
}

impl HwConnection {
    pub fn dma_cost(&self, nbytes: i64) -> i64 {
        self.fix_cost + self.write_cost * nbytes
    }

    pub fn access_cost(&self, nread: i64, nwrite: i64) -> i64 {
        self.read_cost * nread + self.write_cost * nwrite
    }
}

#[derive(Debug, Default)]
pub struct Platform {
    pub core_types: Vec<CoreType>,
    pub cores: Vec<Core>,
    pub dma_controllers: Vec<DmaController>,
    pub memories: Vec<Memory>,
    pub groups: Vec<HwGroup>,
    graph: Graph<Component, HwConnection>,
}

impl Platform {
    pub fn new() -> Platform {
        Platform::default()
    }

    pub fn graph(&self) -> &Graph<Component, HwConnection> {
        &self.graph
    }

    pub fn add_core_type(&mut self, name: impl Into<String>) -> usize {
        self.core_types.push(CoreType { name: name.into() });
        self.core_types.len() - 1
    }

    pub fn add_core(&mut self, name: impl Into<String>, core_type: usize) -> usize {
        let index = self.cores.len();
        let node = self.graph.add_node(Component::Core(index));
        self.cores.push(Core {
            name: name.into(),
            core_type,
            node,
            groups: Vec::new(),
            index,
        });
        index
    }

    pub fn add_dma_controller(&mut self, name: impl Into<String>) -> usize {
        let index = self.dma_controllers.len();
        self.dma_controllers.push(DmaController {
            name: name.into(),
            index,
        });
        index
    }

    pub fn add_memory(&mut self, name: impl Into<String>, size: i64) -> usize {
        let index = self.memories.len();
        let node = self.graph.add_node(Component::Memory(index));
        self.memories.push(Memory {
            name: name.into(),
            size,
            node,
            groups: Vec::new(),
            index,
        });
        index
    }

    pub fn add_group(&mut self, cores: Vec<usize>, memories: Vec<usize>) -> usize {
        let index = self.groups.len();
        let total_mem = memories.iter().map(|&m| self.memories[m].size).sum();
        for &c in &cores {
            self.cores[c].groups.push(index);
        }
        for &m in &memories {
            self.memories[m].groups.push(index);
        }
        self.groups.push(HwGroup {
            cores,
            memories,
            total_mem,
            index,
        });
        index
    }

    /// Connects a core to a memory with per-access costs.
    pub fn connect_core(&mut self, core: usize, memory: usize, read_cost: i64, write_cost: i64) {
        let conn = HwConnection {
            read_cost,
            write_cost,
            ..HwConnection::default()
        };
        self.graph
            .add_edge(self.cores[core].node, self.memories[memory].node, conn);
    }

    /// Connects two memories through DMA controllers.
    pub fn connect_memories(
        &mut self,
        from: usize,
        to: usize,
        fix_cost: i64,
        byte_cost: i64,
        controllers: Vec<usize>,
    ) {
        let conn = HwConnection {
            fix_cost,
            write_cost: byte_cost,
            controllers,
            ..HwConnection::default()
        };
        self.graph
            .add_edge(self.memories[from].node, self.memories[to].node, conn);
    }

    pub fn core_by_name(&self, name: &str) -> Option<usize> {
        self.cores.iter().position(|c| c.name == name)
    }

    pub fn memory_by_name(&self, name: &str) -> Option<usize> {
        self.memories.iter().position(|m| m.name == name)
    }

    /// Lookup map from (source node, target node) to the connection. Valid
    /// until the platform is modified.
    pub fn conn_map(&self) -> HashMap<(NodeId, NodeId), &HwConnection> {
        let mut map = HashMap::new();
        for (e, conn) in self.graph.edges() {
            map.insert((self.graph.source(e), self.graph.target(e)), conn);
        }
        map
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_and_query_connections() {
        let mut pf = Platform::new();
        let ct = pf.add_core_type("dsp");
        let c0 = pf.add_core("core0", ct);
        let m0 = pf.add_memory("mem0", 64 * 1024);
        let m1 = pf.add_memory("mem1", 64 * 1024);
        let dma = pf.add_dma_controller("dma0");
        pf.connect_core(c0, m0, 2, 3);
        pf.connect_memories(m0, m1, 100, 1, vec![dma]);

        let map = pf.conn_map();
        let cm = map[&(pf.cores[c0].node, pf.memories[m0].node)];
        assert_eq!(cm.access_cost(10, 5), 2 * 10 + 3 * 5);

        let mm = map[&(pf.memories[m0].node, pf.memories[m1].node)];
        assert_eq!(mm.dma_cost(256), 100 + 256);
        assert_eq!(mm.controllers, vec![dma]);

        assert!(map.get(&(pf.memories[m1].node, pf.memories[m0].node)).is_none());
    }

    #[test]
    fn groups_aggregate_memory() {
        let mut pf = Platform::new();
        let ct = pf.add_core_type("pe");
        let c0 = pf.add_core("c0", ct);
        let c1 = pf.add_core("c1", ct);
        let m0 = pf.add_memory("m0", 1024);
        let m1 = pf.add_memory("m1", 2048);
        let g = pf.add_group(vec![c0, c1], vec![m0, m1]);
        assert_eq!(pf.groups[g].total_mem, 3072);
        assert_eq!(pf.cores[c0].groups, vec![g]);
        assert_eq!(pf.memories[m1].groups, vec![g]);
    }
}
