pub mod system_allocator;
