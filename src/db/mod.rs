pub mod dbcanvas;
