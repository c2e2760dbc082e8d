//! External driver surface contracts (SPEC_FULL.md §4.7). Every driver is a
//! trait so the dispatcher and provisioner/campaign engine can be exercised
//! against fakes in tests without a live OpenStack/RabbitMQ/Docker stack.

pub mod amqp_admin;
pub mod container;
pub mod heat;
pub mod openstack;
pub mod process;
