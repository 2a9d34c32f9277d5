//! icogrid runs rotation-equivariant convolutions over features that live
//! on the vertices of a subdivided icosahedron.
//!
//! The sphere is cut into five charts, each a `2^r` by `2^(r+1)` patch of a
//! hexagonal lattice, with the two poles left out. A layer pads every chart
//! with one ring of cells gathered from its neighbors across the seams,
//! runs one dense 3x3 correlation per chart with stencils expanded from a
//! compact 7-tap hexagonal kernel, crops the ring away again, and makes the
//! ten cone vertices, where three charts meet, single-valued.
//!
//! The pieces, bottom up:
//!
//! - [topology]: charts, seams, and the map from any lattice coordinate to
//!   the stored cell or pole it names
//! - [padding] and [kernel]: the gather map for the ring, and the stencil
//!   expansion
//! - [conv] and [reconcile]: the dense correlation and the cone vertex fix
//! - [adjacency] and [verify]: an independently derived neighbor table and
//!   the checks that hold the dense path to it
//! - [engine]: [engine::IcoConv], the layer callers use
//! - [config], [tensor_file], [text_tensor], [component], and [args]: the
//!   plumbing around a layer

#![warn(missing_docs)]
pub mod adjacency;
pub mod args;
pub mod component;
pub mod config;
pub mod conv;
pub mod engine;
pub mod error;
pub mod kernel;
pub mod padding;
pub mod reconcile;
pub mod tensor;
pub mod tensor_file;
pub mod text_tensor;
pub mod topology;
pub mod verify;
