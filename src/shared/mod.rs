pub mod bitstream;
pub mod octal;
pub mod octree;
pub mod packet;
pub mod session;
pub mod spatial;
pub mod sync;
pub mod traverse;
