reciperun_difftest::define_pipeline_tests!(
    sim,
    reciperun_sim::SimDevice::shared,
    reciperun_sim::SimCompiler::new
);
