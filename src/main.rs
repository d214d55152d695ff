mod app;

fn main() {
    app::entrypoint();
}
