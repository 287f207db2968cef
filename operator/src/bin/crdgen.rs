use gateway_operator::crds::crds;

// Prints every CustomResourceDefinition the operator serves as a multi-document YAML stream.
fn main() -> anyhow::Result<()> {
    for crd in crds() {
        print!("---\n{}", serde_yaml::to_string(&crd)?);
    }
    Ok(())
}
