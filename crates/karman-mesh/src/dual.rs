// crates/karman-mesh/src/dual.rs

//! Median-dual grid over an unstructured element mesh.
//!
//! The dual cell of a point is bounded by pieces cut from every element
//! incident to it: in 2-D the segment from an element-edge midpoint to the
//! element centroid, in 3-D the triangles spanned by an edge midpoint, the
//! centroids of the two faces sharing the edge, and the cell centroid.
//! Each piece contributes an area vector to its edge's dual normal (oriented
//! node0 -> node1) and, via the divergence theorem `V = (1/d) oint x·n dS`,
//! a volume contribution to the two adjacent dual cells. Boundary markers
//! close the dual cells with outward surface pieces, which also accumulate
//! the boundary vertex normals.
//!
//! Halo points occupy a contiguous tail of the point arena, grouped by
//! owning rank and ascending global id, so index order doubles as the
//! owned/halo classifier and matches the peer's deterministic pack order.

use crate::topo;
use karman_core::{
    CoreResult, ExchangePlan, GlobalId, KarmanError, PointId, Scalar, Transform, VtkKind, MAX_DIM,
    NO_DONOR,
};
use std::collections::{BTreeMap, HashMap};

/// Interior edge of the dual grid. `normal` is the accumulated dual-face
/// area vector pointing from `nodes[0]` to `nodes[1]`.
#[derive(Clone, Debug)]
pub struct Edge {
    pub nodes: [PointId; 2],
    pub normal: [Scalar; MAX_DIM],
}

/// Surface element of a boundary marker.
#[derive(Clone, Debug)]
pub struct SurfElem {
    pub vtk: VtkKind,
    pub nodes: Vec<PointId>,
    /// Volume element this face belongs to.
    pub parent_elem: usize,
}

/// Boundary point instance on a marker.
#[derive(Clone, Debug)]
pub struct Vertex {
    pub point: PointId,
    /// Area-weighted outward normal (points away from the interior).
    pub normal: [Scalar; MAX_DIM],
    /// Interior neighbor most aligned with the inward normal direction.
    pub normal_neighbor: PointId,
}

/// Boundary marker: a tagged set of surface elements and vertices.
#[derive(Clone, Debug)]
pub struct Marker {
    pub tag: String,
    pub periodic: bool,
    /// Exchange-plan transform index for periodic markers (0 otherwise).
    pub transform: u32,
    pub vertices: Vec<Vertex>,
    pub surf_elems: Vec<SurfElem>,
    /// Cumulative surface-element counts per time level (exclusive bounds).
    pub surf_count_per_level: Vec<usize>,
}

/// Volume element retained for FEM assembly and surface/parent lookups.
#[derive(Clone, Debug)]
pub struct VolElem {
    pub vtk: VtkKind,
    pub nodes: Vec<PointId>,
    pub owned: bool,
    pub time_level: u8,
    pub global_id: u64,
}

/// The partitioned dual mesh of one rank.
#[derive(Clone, Debug)]
pub struct DualMesh {
    pub n_dim: usize,
    /// Total points including halos.
    pub n_point: usize,
    /// Owned points occupy `0..n_point_owned`.
    pub n_point_owned: usize,
    /// Point coordinates, `n_point * n_dim`.
    pub coords: Vec<Scalar>,
    pub global_id: Vec<GlobalId>,
    /// Periodic donor point index, `NO_DONOR` if none.
    pub periodic_donor: Vec<i64>,
    /// Dual-cell volume per point (owned entries are exact).
    pub volume: Vec<Scalar>,
    pub edges: Vec<Edge>,
    /// Edge ids incident to each point.
    pub point_edges: Vec<Vec<usize>>,
    pub elements: Vec<VolElem>,
    pub markers: Vec<Marker>,
    /// Halo-exchange schedule; fixed after partitioning.
    pub plan: ExchangePlan,
    /// Optional grid velocity, `n_point * n_dim`.
    pub grid_vel: Option<Vec<Scalar>>,
}

impl DualMesh {
    /// Coordinate slice of a point.
    #[inline]
    #[must_use]
    pub fn coord(&self, p: PointId) -> &[Scalar] {
        &self.coords[p * self.n_dim..(p + 1) * self.n_dim]
    }

    /// Whether `p` is owned by this rank.
    #[inline]
    #[must_use]
    pub fn is_owned(&self, p: PointId) -> bool {
        p < self.n_point_owned
    }

    /// Edge-connected neighbors of a point.
    pub fn neighbors(&self, p: PointId) -> impl Iterator<Item = PointId> + '_ {
        self.point_edges[p].iter().map(move |&e| {
            let [a, b] = self.edges[e].nodes;
            if a == p {
                b
            } else {
                a
            }
        })
    }

    /// Distance between two points.
    #[must_use]
    pub fn distance(&self, a: PointId, b: PointId) -> Scalar {
        let (xa, xb) = (self.coord(a), self.coord(b));
        (0..self.n_dim).map(|d| (xb[d] - xa[d]).powi(2)).sum::<Scalar>().sqrt()
    }
}

/* ------------------------------- builder ---------------------------------- */

/// Programmatic mesh assembly. Geometry file readers are external
/// collaborators that feed this builder.
#[derive(Clone, Debug)]
pub struct MeshBuilder {
    n_dim: usize,
    coords: Vec<[Scalar; MAX_DIM]>,
    elems: Vec<(VtkKind, Vec<usize>)>,
    markers: Vec<(String, Vec<(VtkKind, Vec<usize>)>)>,
    periodic: Vec<(usize, usize, Transform)>,
}

impl MeshBuilder {
    #[must_use]
    pub fn new(n_dim: usize) -> Self {
        assert!((2..=3).contains(&n_dim), "only 2-D and 3-D meshes are supported");
        Self { n_dim, coords: Vec::new(), elems: Vec::new(), markers: Vec::new(), periodic: Vec::new() }
    }

    /// Add a point; returns its global index.
    pub fn point(&mut self, coord: &[Scalar]) -> usize {
        let mut c = [0.0; MAX_DIM];
        c[..self.n_dim].copy_from_slice(&coord[..self.n_dim]);
        self.coords.push(c);
        self.coords.len() - 1
    }

    /// Add a volume element; corner count must match the VTK kind.
    pub fn element(&mut self, vtk: VtkKind, nodes: &[usize]) -> CoreResult<usize> {
        if nodes.len() != vtk.n_corners() {
            return Err(KarmanError::Mesh(format!("{vtk} expects {} corners, got {}", vtk.n_corners(), nodes.len())));
        }
        if vtk.dim() != self.n_dim {
            return Err(KarmanError::Mesh(format!("{vtk} in a {}-D mesh", self.n_dim)));
        }
        self.elems.push((vtk, nodes.to_vec()));
        Ok(self.elems.len() - 1)
    }

    /// Declare a marker; returns its index.
    pub fn marker(&mut self, tag: &str) -> usize {
        self.markers.push((tag.to_owned(), Vec::new()));
        self.markers.len() - 1
    }

    /// Add a surface element to a marker.
    pub fn surf(&mut self, marker: usize, vtk: VtkKind, nodes: &[usize]) -> CoreResult<()> {
        if vtk.dim() != self.n_dim - 1 {
            return Err(KarmanError::Mesh(format!("{vtk} is not a surface kind in {}-D", self.n_dim)));
        }
        self.markers[marker].1.push((vtk, nodes.to_vec()));
        Ok(())
    }

    /// Declare a periodic marker pair: values on `target` points are
    /// received from `donor` points through `transform`.
    pub fn periodic(&mut self, donor: usize, target: usize, transform: Transform) {
        self.periodic.push((donor, target, transform));
    }

    /// Axis-aligned rectangle of quadrilaterals with markers
    /// `left`, `right`, `bottom`, `top`. Test and demo mesh source.
    #[must_use]
    pub fn rect_2d(nx: usize, ny: usize, lx: Scalar, ly: Scalar) -> Self {
        let mut b = Self::new(2);
        #[allow(clippy::cast_precision_loss)]
        for j in 0..=ny {
            for i in 0..=nx {
                b.point(&[lx * i as Scalar / nx as Scalar, ly * j as Scalar / ny as Scalar]);
            }
        }
        let id = |i: usize, j: usize| j * (nx + 1) + i;
        for j in 0..ny {
            for i in 0..nx {
                b.elems.push((
                    VtkKind::Quadrilateral,
                    vec![id(i, j), id(i + 1, j), id(i + 1, j + 1), id(i, j + 1)],
                ));
            }
        }
        let left = b.marker("left");
        let right = b.marker("right");
        let bottom = b.marker("bottom");
        let top = b.marker("top");
        for j in 0..ny {
            b.markers[left].1.push((VtkKind::Line, vec![id(0, j + 1), id(0, j)]));
            b.markers[right].1.push((VtkKind::Line, vec![id(nx, j), id(nx, j + 1)]));
        }
        for i in 0..nx {
            b.markers[bottom].1.push((VtkKind::Line, vec![id(i, 0), id(i + 1, 0)]));
            b.markers[top].1.push((VtkKind::Line, vec![id(i + 1, ny), id(i, ny)]));
        }
        b
    }

    /// Serial build: one rank owns everything; the plan carries only
    /// periodic self-communication entries.
    pub fn build(self) -> CoreResult<DualMesh> {
        let n = self.coords.len();
        let owner = vec![0usize; n];
        self.build_partitioned(&owner, 0, 1)
    }

    /// Partitioned build for `rank` out of `n_ranks` given a global
    /// point-ownership map.
    pub fn build_partitioned(self, owner: &[usize], rank: usize, n_ranks: usize) -> CoreResult<DualMesh> {
        if owner.len() != self.coords.len() {
            return Err(KarmanError::Mesh(format!(
                "ownership map covers {} points, mesh has {}",
                owner.len(),
                self.coords.len()
            )));
        }
        if self.elems.is_empty() {
            return Err(KarmanError::Mesh("mesh has no volume elements".into()));
        }

        // Elements this rank keeps: at least one owned corner.
        let kept: Vec<usize> = (0..self.elems.len())
            .filter(|&e| self.elems[e].1.iter().any(|&p| owner[p] == rank))
            .collect();
        if kept.is_empty() {
            return Err(KarmanError::Mesh(format!("rank {rank} owns no elements; halo partitioning gap")));
        }

        // Local point set: owned points in global order, then halos grouped
        // by owning rank ascending and global id ascending.
        let mut local_of: HashMap<usize, PointId> = HashMap::new();
        let mut globals: Vec<usize> = Vec::new();
        for (g, &o) in owner.iter().enumerate() {
            if o == rank {
                local_of.insert(g, globals.len());
                globals.push(g);
            }
        }
        let n_owned = globals.len();
        let mut halo_by_rank: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for &e in &kept {
            for &p in &self.elems[e].1 {
                if owner[p] != rank && !local_of.contains_key(&p) {
                    // Mark now; ordering fixed after the scan.
                    local_of.insert(p, usize::MAX);
                    halo_by_rank.entry(owner[p]).or_default().push(p);
                }
            }
        }
        for list in halo_by_rank.values_mut() {
            list.sort_unstable();
        }
        for (_, list) in &halo_by_rank {
            for &g in list {
                local_of.insert(g, globals.len());
                globals.push(g);
            }
        }
        let n_point = globals.len();

        let n_dim = self.n_dim;
        let mut coords = vec![0.0; n_point * n_dim];
        for (l, &g) in globals.iter().enumerate() {
            coords[l * n_dim..(l + 1) * n_dim].copy_from_slice(&self.coords[g][..n_dim]);
        }

        // Local elements. An element is owned by the rank owning its lowest
        // global corner; owned elements come before halos in storage.
        let mut elements: Vec<VolElem> = kept
            .iter()
            .map(|&e| {
                let (vtk, nodes) = &self.elems[e];
                let owner_rank = nodes.iter().min().map_or(rank, |&g| owner[g]);
                VolElem {
                    vtk: *vtk,
                    nodes: nodes.iter().map(|g| local_of[g]).collect(),
                    owned: owner_rank == rank,
                    time_level: 0,
                    global_id: e as u64,
                }
            })
            .collect();
        elements.sort_by_key(|el| !el.owned);

        // Edge set: element edges with at least one owned endpoint,
        // oriented node0 < node1 (local order puts owned first).
        let mut edge_of: HashMap<(PointId, PointId), usize> = HashMap::new();
        let mut edges: Vec<Edge> = Vec::new();
        for el in &elements {
            for &(a, b) in topo::elem_edges(el.vtk) {
                let (mut i, mut j) = (el.nodes[a], el.nodes[b]);
                if i > j {
                    std::mem::swap(&mut i, &mut j);
                }
                if i >= n_owned {
                    continue; // halo-halo edge: the owner assembles it
                }
                edge_of.entry((i, j)).or_insert_with(|| {
                    edges.push(Edge { nodes: [i, j], normal: [0.0; MAX_DIM] });
                    edges.len() - 1
                });
            }
        }

        let mut volume = vec![0.0; n_point];
        accumulate_dual_metrics(n_dim, &coords, &elements, &edge_of, &mut edges, &mut volume);

        // Markers restricted to surface elements with at least one owned corner.
        let mut markers = Vec::with_capacity(self.markers.len());
        for (tag, surfs) in &self.markers {
            let mut marker = Marker {
                tag: tag.clone(),
                periodic: false,
                transform: 0,
                vertices: Vec::new(),
                surf_elems: Vec::new(),
                surf_count_per_level: Vec::new(),
            };
            let mut vertex_normal: BTreeMap<PointId, [Scalar; MAX_DIM]> = BTreeMap::new();
            for (vtk, gnodes) in surfs {
                if !gnodes.iter().any(|&g| owner[g] == rank) {
                    continue;
                }
                if !gnodes.iter().all(|g| local_of.contains_key(g)) {
                    return Err(KarmanError::Mesh(format!(
                        "marker {tag:?}: surface element references a point outside the halo layer"
                    )));
                }
                let nodes: Vec<PointId> = gnodes.iter().map(|g| local_of[g]).collect();
                let parent = find_parent_elem(&elements, &nodes).ok_or_else(|| {
                    KarmanError::Mesh(format!("marker {tag:?}: surface element matches no volume element"))
                })?;
                accumulate_boundary_metrics(
                    n_dim,
                    &coords,
                    &nodes,
                    elem_centroid(n_dim, &coords, &elements[parent].nodes),
                    &mut vertex_normal,
                    &mut volume,
                );
                marker.surf_elems.push(SurfElem { vtk: *vtk, nodes, parent_elem: parent });
            }
            marker.surf_count_per_level = vec![marker.surf_elems.len()];
            // Vertices: owned marker points only, in ascending point order.
            for (&p, &normal) in &vertex_normal {
                if p < n_owned {
                    marker.vertices.push(Vertex { point: p, normal, normal_neighbor: p });
                }
            }
            markers.push(marker);
        }

        // Exchange plan: receive halos from their owners; send owned points
        // that appear in elements touching each peer rank.
        let mut plan = ExchangePlan::empty();
        for (&r, list) in &halo_by_rank {
            plan.ranks_recv.push(r);
            let ents: Vec<usize> = list.iter().map(|g| local_of[g]).collect();
            plan.transform_recv.push(vec![0; ents.len()]);
            plan.entities_recv.push(ents);
        }
        let mut send_by_rank: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for (_e, (_, nodes)) in self.elems.iter().enumerate() {
            let touches: Vec<usize> = nodes.iter().map(|&p| owner[p]).collect();
            if !touches.contains(&rank) {
                continue;
            }
            for &r in &touches {
                if r == rank {
                    continue;
                }
                let set = send_by_rank.entry(r).or_default();
                for &p in nodes {
                    if owner[p] == rank {
                        set.push(p);
                    }
                }
            }
        }
        for (r, mut list) in send_by_rank {
            list.sort_unstable();
            list.dedup();
            plan.ranks_send.push(r);
            plan.entities_send.push(list.iter().map(|g| local_of[g]).collect());
        }

        let mut mesh = DualMesh {
            n_dim,
            n_point,
            n_point_owned: n_owned,
            coords,
            global_id: globals.iter().map(|&g| g as GlobalId).collect(),
            periodic_donor: vec![NO_DONOR; n_point],
            volume,
            edges,
            point_edges: Vec::new(),
            elements,
            markers,
            plan,
            grid_vel: None,
        };
        mesh.point_edges = build_point_edges(mesh.n_point, &mesh.edges);
        set_normal_neighbors(&mut mesh);
        if n_ranks == 1 {
            apply_periodic(&mut mesh, &self.periodic)?;
        } else if !self.periodic.is_empty() {
            return Err(KarmanError::Mesh("periodic markers require the serial build".into()));
        }
        Ok(mesh)
    }
}

/* ----------------------------- metric helpers ------------------------------ */

fn elem_centroid(n_dim: usize, coords: &[Scalar], nodes: &[PointId]) -> [Scalar; MAX_DIM] {
    let mut c = [0.0; MAX_DIM];
    for &p in nodes {
        for d in 0..n_dim {
            c[d] += coords[p * n_dim + d];
        }
    }
    #[allow(clippy::cast_precision_loss)]
    let inv = 1.0 / nodes.len() as Scalar;
    for d in 0..n_dim {
        c[d] *= inv;
    }
    c
}

fn midpoint(n_dim: usize, coords: &[Scalar], a: PointId, b: PointId) -> [Scalar; MAX_DIM] {
    let mut m = [0.0; MAX_DIM];
    for d in 0..n_dim {
        m[d] = 0.5 * (coords[a * n_dim + d] + coords[b * n_dim + d]);
    }
    m
}

fn cross(a: [Scalar; 3], b: [Scalar; 3]) -> [Scalar; 3] {
    [a[1] * b[2] - a[2] * b[1], a[2] * b[0] - a[0] * b[2], a[0] * b[1] - a[1] * b[0]]
}

fn sub(a: &[Scalar; MAX_DIM], b: &[Scalar; MAX_DIM]) -> [Scalar; 3] {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

/// Add one dual-face piece to edge (i,j): orient `n_piece` along i->j, then
/// update the edge normal and both adjacent dual volumes via `x_c · n / d`.
fn apply_piece(
    n_dim: usize,
    coords: &[Scalar],
    i: PointId,
    j: PointId,
    mut n_piece: [Scalar; 3],
    centroid: [Scalar; MAX_DIM],
    edge: &mut Edge,
    volume: &mut [Scalar],
) {
    let mut along = 0.0;
    for d in 0..n_dim {
        along += n_piece[d] * (coords[j * n_dim + d] - coords[i * n_dim + d]);
    }
    if along < 0.0 {
        for c in &mut n_piece {
            *c = -*c;
        }
    }
    #[allow(clippy::cast_precision_loss)]
    let inv_d = 1.0 / n_dim as Scalar;
    let mut xc_dot_n = 0.0;
    for d in 0..n_dim {
        edge.normal[d] += n_piece[d];
        xc_dot_n += centroid[d] * n_piece[d];
    }
    volume[i] += inv_d * xc_dot_n;
    volume[j] -= inv_d * xc_dot_n;
}

fn accumulate_dual_metrics(
    n_dim: usize,
    coords: &[Scalar],
    elements: &[VolElem],
    edge_of: &HashMap<(PointId, PointId), usize>,
    edges: &mut [Edge],
    volume: &mut [Scalar],
) {
    for el in elements {
        let cc = elem_centroid(n_dim, coords, &el.nodes);
        for &(la, lb) in topo::elem_edges(el.vtk) {
            let (mut i, mut j) = (el.nodes[la], el.nodes[lb]);
            if i > j {
                std::mem::swap(&mut i, &mut j);
            }
            let Some(&e) = edge_of.get(&(i, j)) else { continue };
            let m = midpoint(n_dim, coords, i, j);
            if n_dim == 2 {
                let t = sub(&cc, &m);
                let n_piece = [t[1], -t[0], 0.0];
                let mut pc = [0.0; MAX_DIM];
                for d in 0..2 {
                    pc[d] = 0.5 * (m[d] + cc[d]);
                }
                apply_piece(n_dim, coords, i, j, n_piece, pc, &mut edges[e], volume);
            } else {
                // The two element faces sharing this edge.
                for f in topo::elem_faces(el.vtk) {
                    let has_a = f.contains(&la);
                    let has_b = f.contains(&lb);
                    if !(has_a && has_b) {
                        continue;
                    }
                    let fnodes: Vec<PointId> = f.iter().map(|&k| el.nodes[k]).collect();
                    let fc = elem_centroid(n_dim, coords, &fnodes);
                    let n_piece = cross(sub(&fc, &m), sub(&cc, &m));
                    let n_half = [0.5 * n_piece[0], 0.5 * n_piece[1], 0.5 * n_piece[2]];
                    let mut pc = [0.0; MAX_DIM];
                    for d in 0..3 {
                        pc[d] = (m[d] + fc[d] + cc[d]) / 3.0;
                    }
                    apply_piece(n_dim, coords, i, j, n_half, pc, &mut edges[e], volume);
                }
            }
        }
    }
}

/// Outward boundary piece per surface-element corner: updates the corner's
/// vertex normal and closes its dual volume.
fn accumulate_boundary_metrics(
    n_dim: usize,
    coords: &[Scalar],
    nodes: &[PointId],
    parent_centroid: [Scalar; MAX_DIM],
    vertex_normal: &mut BTreeMap<PointId, [Scalar; MAX_DIM]>,
    volume: &mut [Scalar],
) {
    #[allow(clippy::cast_precision_loss)]
    let inv_d = 1.0 / n_dim as Scalar;
    let mut push = |p: PointId, mut n_piece: [Scalar; 3], pc: [Scalar; MAX_DIM]| {
        // Outward: away from the parent element.
        let mut out = 0.0;
        for d in 0..n_dim {
            out += n_piece[d] * (pc[d] - parent_centroid[d]);
        }
        if out < 0.0 {
            for c in &mut n_piece {
                *c = -*c;
            }
        }
        let entry = vertex_normal.entry(p).or_insert([0.0; MAX_DIM]);
        let mut xc_dot_n = 0.0;
        for d in 0..n_dim {
            entry[d] += n_piece[d];
            xc_dot_n += pc[d] * n_piece[d];
        }
        volume[p] += inv_d * xc_dot_n;
    };

    if n_dim == 2 {
        let m = midpoint(n_dim, coords, nodes[0], nodes[1]);
        for &p in &nodes[..2] {
            let xp = &coords[p * n_dim..(p + 1) * n_dim];
            let t = [m[0] - xp[0], m[1] - xp[1]];
            let n_piece = [t[1], -t[0], 0.0];
            let pc = [0.5 * (xp[0] + m[0]), 0.5 * (xp[1] + m[1]), 0.0];
            push(p, n_piece, pc);
        }
    } else {
        let fc = elem_centroid(n_dim, coords, nodes);
        let k = nodes.len();
        for idx in 0..k {
            let p = nodes[idx];
            let m_prev = midpoint(n_dim, coords, nodes[(idx + k - 1) % k], p);
            let m_next = midpoint(n_dim, coords, p, nodes[(idx + 1) % k]);
            let xp = [coords[p * n_dim], coords[p * n_dim + 1], coords[p * n_dim + 2]];
            for (a, b) in [(m_next, fc), (fc, m_prev)] {
                let n_piece = cross(sub(&a, &xp), sub(&b, &xp));
                let n_half = [0.5 * n_piece[0], 0.5 * n_piece[1], 0.5 * n_piece[2]];
                let pc = [(xp[0] + a[0] + b[0]) / 3.0, (xp[1] + a[1] + b[1]) / 3.0, (xp[2] + a[2] + b[2]) / 3.0];
                push(p, n_half, pc);
            }
        }
    }
}

fn find_parent_elem(elements: &[VolElem], face_nodes: &[PointId]) -> Option<usize> {
    elements
        .iter()
        .position(|el| face_nodes.iter().all(|p| el.nodes.contains(p)))
}

fn build_point_edges(n_point: usize, edges: &[Edge]) -> Vec<Vec<usize>> {
    let mut pe = vec![Vec::new(); n_point];
    for (e, edge) in edges.iter().enumerate() {
        pe[edge.nodes[0]].push(e);
        pe[edge.nodes[1]].push(e);
    }
    pe
}

/// Pick each boundary vertex's interior neighbor: the edge neighbor whose
/// direction is most anti-aligned with the outward normal.
fn set_normal_neighbors(mesh: &mut DualMesh) {
    let n_dim = mesh.n_dim;
    for m in 0..mesh.markers.len() {
        for v in 0..mesh.markers[m].vertices.len() {
            let p = mesh.markers[m].vertices[v].point;
            let normal = mesh.markers[m].vertices[v].normal;
            let mut best = p;
            let mut best_score = Scalar::MAX;
            for q in mesh.neighbors(p).collect::<Vec<_>>() {
                let mut align = 0.0;
                let mut dist2 = 0.0;
                for d in 0..n_dim {
                    let dx = mesh.coords[q * n_dim + d] - mesh.coords[p * n_dim + d];
                    align += dx * normal[d];
                    dist2 += dx * dx;
                }
                // Inward means against the outward normal; smaller is better.
                let score = align / dist2.sqrt().max(Scalar::MIN_POSITIVE);
                if score < best_score {
                    best_score = score;
                    best = q;
                }
            }
            mesh.markers[m].vertices[v].normal_neighbor = best;
        }
    }
}

/// Serial periodic coupling: match target-marker points against transformed
/// donor-marker points, record donor indices, and add self-communication
/// entries carrying the transform.
fn apply_periodic(mesh: &mut DualMesh, pairs: &[(usize, usize, Transform)]) -> CoreResult<()> {
    for (donor_m, target_m, transform) in pairs {
        let n_dim = mesh.n_dim;
        let donors: Vec<PointId> = mesh.markers[*donor_m].vertices.iter().map(|v| v.point).collect();
        let targets: Vec<PointId> = mesh.markers[*target_m].vertices.iter().map(|v| v.point).collect();
        if donors.len() != targets.len() {
            return Err(KarmanError::Mesh(format!(
                "periodic markers {:?}/{:?} have {} vs {} vertices",
                mesh.markers[*donor_m].tag,
                mesh.markers[*target_m].tag,
                donors.len(),
                targets.len()
            )));
        }
        mesh.plan.transforms.push(transform.clone());
        let t_idx = (mesh.plan.transforms.len() - 1) as u32;
        mesh.markers[*donor_m].periodic = true;
        mesh.markers[*target_m].periodic = true;
        mesh.markers[*target_m].transform = t_idx;

        let mut send = Vec::with_capacity(donors.len());
        let mut recv = Vec::with_capacity(targets.len());
        for &t in &targets {
            // Nearest transformed donor.
            let tx = mesh.coord(t).to_vec();
            let mut best = None;
            let mut best_d2 = Scalar::MAX;
            for &dnr in &donors {
                let mut img = [0.0; MAX_DIM];
                img[..n_dim].copy_from_slice(mesh.coord(dnr));
                transform.apply_vector(&mut img, n_dim);
                for d in 0..n_dim {
                    img[d] += transform.translation[d];
                }
                let d2: Scalar = (0..n_dim).map(|d| (img[d] - tx[d]).powi(2)).sum();
                if d2 < best_d2 {
                    best_d2 = d2;
                    best = Some(dnr);
                }
            }
            let dnr = best.ok_or_else(|| KarmanError::Mesh("periodic marker has no donors".into()))?;
            mesh.periodic_donor[t] = dnr as i64;
            send.push(dnr);
            recv.push(t);
        }
        mesh.plan.ranks_send.push(0);
        mesh.plan.entities_send.push(send);
        mesh.plan.ranks_recv.push(0);
        mesh.plan.transform_recv.push(vec![t_idx; recv.len()]);
        mesh.plan.entities_recv.push(recv);
    }
    Ok(())
}
