#![allow(unused_assignments)] // thiserror/miette proc macros trigger false positives

pub mod cli;
pub mod cloudinit;
pub mod disk;
pub mod domain_xml;
pub mod error;
pub mod hypervisor;
pub mod image;
pub mod paths;
pub mod settings;
pub mod template;
