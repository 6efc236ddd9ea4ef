// crates/karman-mesh/src/topo.rs

//! Local topology tables for the supported VTK cell kinds.
//!
//! Corner numbering follows the VTK convention. Face corner lists are wound
//! so the face normal points out of the element.

use karman_core::VtkKind;

/// Local corner indices of each face of a volume element (edges for the 2-D
/// kinds). Winding is outward.
#[must_use]
pub fn elem_faces(kind: VtkKind) -> &'static [&'static [usize]] {
    match kind {
        VtkKind::Line => &[&[0], &[1]],
        VtkKind::Triangle => &[&[0, 1], &[1, 2], &[2, 0]],
        VtkKind::Quadrilateral => &[&[0, 1], &[1, 2], &[2, 3], &[3, 0]],
        VtkKind::Tetrahedron => &[&[0, 2, 1], &[0, 1, 3], &[1, 2, 3], &[0, 3, 2]],
        VtkKind::Pyramid => &[&[0, 3, 2, 1], &[0, 1, 4], &[1, 2, 4], &[2, 3, 4], &[3, 0, 4]],
        VtkKind::Prism => &[&[0, 1, 2], &[3, 5, 4], &[0, 3, 4, 1], &[1, 4, 5, 2], &[2, 5, 3, 0]],
        VtkKind::Hexahedron => &[
            &[0, 3, 2, 1],
            &[4, 5, 6, 7],
            &[0, 1, 5, 4],
            &[1, 2, 6, 5],
            &[2, 3, 7, 6],
            &[3, 0, 4, 7],
        ],
    }
}

/// Local corner pairs forming the edges of a volume element.
#[must_use]
pub fn elem_edges(kind: VtkKind) -> &'static [(usize, usize)] {
    match kind {
        VtkKind::Line => &[(0, 1)],
        VtkKind::Triangle => &[(0, 1), (1, 2), (2, 0)],
        VtkKind::Quadrilateral => &[(0, 1), (1, 2), (2, 3), (3, 0)],
        VtkKind::Tetrahedron => &[(0, 1), (1, 2), (2, 0), (0, 3), (1, 3), (2, 3)],
        VtkKind::Pyramid => &[(0, 1), (1, 2), (2, 3), (3, 0), (0, 4), (1, 4), (2, 4), (3, 4)],
        VtkKind::Prism => &[
            (0, 1),
            (1, 2),
            (2, 0),
            (3, 4),
            (4, 5),
            (5, 3),
            (0, 3),
            (1, 4),
            (2, 5),
        ],
        VtkKind::Hexahedron => &[
            (0, 1),
            (1, 2),
            (2, 3),
            (3, 0),
            (4, 5),
            (5, 6),
            (6, 7),
            (7, 4),
            (0, 4),
            (1, 5),
            (2, 6),
            (3, 7),
        ],
    }
}

/// VTK kind of face `i_face` of a volume element.
#[must_use]
pub fn face_kind(kind: VtkKind, i_face: usize) -> VtkKind {
    match elem_faces(kind)[i_face].len() {
        2 => VtkKind::Line,
        3 => VtkKind::Triangle,
        _ => VtkKind::Quadrilateral,
    }
}
