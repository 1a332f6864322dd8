#[actix_web::main]
async fn main() -> eyre::Result<()> {
    postbox::run().start().await
}
