//! Subgrid is the coordination layer of a block-structured adaptive mesh
//! refinement (AMR) code: subcycled time stepping over a hierarchy of
//! refinement levels, truncation error estimation against a half-resolution
//! shadow of the coarse level, and a regrid engine that prefers cheap local
//! block additions over full hierarchy rebuilds. Levels are made of
//! rectilinear patches aligned to a fixed blocking factor, in the style of
//! Berger-Oliger AMR; the block bookkeeping is reconciled across ranks with
//! pairwise exchanges so that every rank takes the same regrid decisions.

pub mod config;
pub mod index_space;
pub mod integrator;
pub mod layout;
pub mod level;
pub mod local_regrid;
pub mod location;
pub mod message;
pub mod patch;
pub mod scheduler;
pub mod sim;
pub mod synchronizer;
pub mod time_stepper;
pub mod unique_layout;
